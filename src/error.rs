use serde::Serialize;
use thiserror::Error;

/// Patterns (lowercase) that indicate sensitive data not safe for operator output.
/// Used by `contains_sensitive()` for case-insensitive matching.
pub(crate) const SENSITIVE_PATTERNS: &[&str] = &[
    "bearer ",
    "access_token",
    "private_key",
    "client_secret",
    "authorization:",
];

/// Returns true if the message contains any sensitive pattern (case-insensitive).
fn contains_sensitive(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitizes a message for operator-facing output.
/// If sensitive content is detected, returns the fallback instead.
fn sanitize_message(msg: &str, fallback: &str) -> String {
    if contains_sensitive(msg) {
        fallback.into()
    } else {
        msg.to_string()
    }
}

/// Operator-facing summary of an error, recorded in job outcomes and task reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorSummary {
    pub kind: &'static str,
    pub message: String,
}

/// Application-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Job payload ───────────────────────────────────────────────────────────
    #[error("Invalid job payload: {0}")]
    InvalidJob(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    // ── Warehouse ─────────────────────────────────────────────────────────────
    #[error("Warehouse credentials could not be loaded: {0}")]
    Credential(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Warehouse error: {0}")]
    Warehouse(String),

    #[error("Query failed for partition {partition}: {message}")]
    QueryExecution { partition: String, message: String },

    #[error("Could not resolve the declared type of column {column} in {table}")]
    ColumnTypeLookup { table: String, column: String },

    // ── Output ────────────────────────────────────────────────────────────────
    #[error("Output could not be written: {0}")]
    OutputPath(String),

    // ── Ambient ───────────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns true for errors that abort the whole job before any query runs.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::InvalidJob(_)
                | AppError::InvalidFilter(_)
                | AppError::Credential(_)
                | AppError::Config(_)
        )
    }

    /// Stable name of the error category, used in logs and job reports.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidJob(_) => "InvalidJobError",
            AppError::InvalidFilter(_) => "InvalidFilterError",
            AppError::Credential(_) => "CredentialError",
            AppError::ConnectionFailed(_) => "ConnectionError",
            AppError::RateLimited { .. } => "RateLimitedError",
            AppError::Warehouse(_) => "WarehouseError",
            AppError::QueryExecution { .. } => "QueryExecutionError",
            AppError::ColumnTypeLookup { .. } => "ColumnTypeLookupError",
            AppError::OutputPath(_) => "OutputPathError",
            AppError::Config(_) => "ConfigError",
            AppError::Storage(_) => "StorageError",
            AppError::Internal(_) => "InternalError",
        }
    }

    /// Converts the error into a message safe for task reports and operator review.
    /// Never leaks tokens or credential file contents.
    pub fn operator_message(&self) -> String {
        match self {
            AppError::Credential(_) => {
                "Warehouse credentials could not be verified. Check the credentials file.".into()
            }
            AppError::RateLimited { retry_after_secs } => match retry_after_secs {
                Some(secs) => format!("The warehouse is limiting requests; retry after {} seconds.", secs),
                None => "The warehouse is limiting requests.".into(),
            },
            AppError::Internal(_) => "Unexpected internal error. See the worker log.".into(),
            other => sanitize_message(&other.to_string(), "An error occurred. See the worker log."),
        }
    }

    pub fn to_summary(&self) -> ErrorSummary {
        ErrorSummary {
            kind: self.kind(),
            message: self.operator_message(),
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Storage(e.to_string())
    }
}
