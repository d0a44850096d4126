pub mod config;
pub mod error;
pub mod extract;
pub mod storage;
pub mod streaming;
pub mod warehouse;
pub mod worker;
