//! BigQuery HTTP client and query execution.
//!
//! - **Secure credential handling** via `secrecy::SecretString`
//! - **Safe logging** that never leaks tokens or sensitive URL parameters
//! - **`WarehouseQuery` implementation** used by the extraction engine

pub mod client;
pub mod credentials;
pub mod query;

pub use client::{BigQueryClient, LoggingMode};
pub use credentials::{load_credentials, WarehouseCredentials};
pub use query::QueryClient;
