pub mod object_store;
pub mod result_store;
pub mod staging;
