//! Worker settings loaded from a TOML file layered under environment variables.
//!
//! Environment variables use the `EXTRACTOR__` prefix with `__` between
//! nesting levels, e.g. `EXTRACTOR__WAREHOUSE__PAGE_SIZE=5000`.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub const DEFAULT_CONFIG_PATH: &str = "config/extractor.toml";
const ENV_PREFIX: &str = "EXTRACTOR";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Name recorded on claimed tasks.
    pub node_name: String,
    /// Task type this worker claims from the queue.
    pub task_type_id: i64,
    /// Restricts claims to one client family when set.
    pub client_family_id: Option<i64>,
    /// Sleep between polls when the queue is empty.
    pub wait_time_secs: u64,
    /// Checked before every poll; `false` stops the worker.
    pub continue_running: bool,
    pub output_dir: PathBuf,
    pub credentials_path: PathBuf,
    pub database_path: PathBuf,
    /// Prefix the last partition's file name with `EOT_`.
    pub mark_final_partition: bool,
    pub warehouse: WarehouseSettings,
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node_name: "extractor".into(),
            task_type_id: 1,
            client_family_id: None,
            wait_time_secs: 300,
            continue_running: true,
            output_dir: PathBuf::from("output"),
            credentials_path: PathBuf::from("config/credentials.json"),
            database_path: PathBuf::from("data/extractor.db"),
            mark_final_partition: false,
            warehouse: WarehouseSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseSettings {
    /// Billing project. Overrides the project in the credential file when set.
    pub project_id: Option<String>,
    pub base_url: String,
    /// Rows requested per result page.
    pub page_size: u32,
    pub request_timeout_secs: u64,
    /// How long the warehouse may hold a query request open before answering
    /// with an incomplete job.
    pub query_timeout_ms: u64,
    /// Delay between polls of an incomplete query job.
    pub poll_interval_ms: u64,
    /// Give up on a query job that is still incomplete after this long.
    pub query_deadline_secs: u64,
    /// Log request query parameters (sensitive values redacted) instead of paths only.
    pub log_query_params: bool,
}

impl Default for WarehouseSettings {
    fn default() -> Self {
        Self {
            project_id: None,
            base_url: "https://bigquery.googleapis.com/bigquery/v2/".into(),
            page_size: 10_000,
            request_timeout_secs: 300,
            query_timeout_ms: 10_000,
            poll_interval_ms: 1_000,
            query_deadline_secs: 3_600,
            log_query_params: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// `pretty` or `json`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

impl Settings {
    /// Loads settings from `path` (optional) and the environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file is malformed or a value fails validation.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let settings: Settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::Config(format!("Failed to read {}: {}", path.display(), e)))?
            .try_deserialize()
            .map_err(|e| AppError::Config(format!("Invalid settings in {}: {}", path.display(), e)))?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.node_name.trim().is_empty() {
            return Err(AppError::Config("node_name must not be empty".into()));
        }
        if self.wait_time_secs == 0 {
            return Err(AppError::Config("wait_time_secs must be greater than 0".into()));
        }
        if self.warehouse.page_size == 0 {
            return Err(AppError::Config("warehouse.page_size must be greater than 0".into()));
        }
        if self.warehouse.request_timeout_secs == 0 {
            return Err(AppError::Config(
                "warehouse.request_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.warehouse.query_deadline_secs == 0 {
            return Err(AppError::Config(
                "warehouse.query_deadline_secs must be greater than 0".into(),
            ));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(AppError::Config(format!(
                "logging.format must be 'pretty' or 'json', got '{}'",
                self.logging.format
            )));
        }
        Ok(())
    }
}
