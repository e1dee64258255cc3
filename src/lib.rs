pub mod config;
pub mod error;
pub mod host;
pub mod input;
pub mod manager;
pub mod process;
pub mod protocol;
pub mod segment;
pub mod tables;
pub mod worker;
