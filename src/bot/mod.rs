pub mod handler;
pub mod runner;
pub mod telegram;
pub mod transport;
