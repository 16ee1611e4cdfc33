pub mod aggregator;
pub mod label_parser;
pub mod types;
