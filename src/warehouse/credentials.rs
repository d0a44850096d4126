//! Warehouse credential loading.
//!
//! Credentials are a pre-minted bearer token and the billing project, read
//! from a JSON file. The token is held in a `SecretString` and is never
//! logged: `WarehouseCredentials` implements a `Debug` that redacts it.

use std::fmt;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::AppError;

/// Credentials for the warehouse API.
#[derive(Clone)]
pub struct WarehouseCredentials {
    /// Project that queries are billed to and run in.
    pub project_id: String,
    pub access_token: SecretString,
}

impl fmt::Debug for WarehouseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarehouseCredentials")
            .field("project_id", &self.project_id)
            .field("access_token", &"***")
            .finish()
    }
}

/// On-disk credential file format.
#[derive(Deserialize)]
struct StoredCredentials {
    access_token: String,
    project_id: String,
}

impl TryFrom<StoredCredentials> for WarehouseCredentials {
    type Error = AppError;

    fn try_from(stored: StoredCredentials) -> Result<Self, Self::Error> {
        if stored.access_token.trim().is_empty() {
            return Err(AppError::Credential("Credential file has an empty token.".into()));
        }
        if stored.project_id.trim().is_empty() {
            return Err(AppError::Credential("Credential file has an empty project.".into()));
        }

        Ok(WarehouseCredentials {
            project_id: stored.project_id.trim().to_string(),
            access_token: SecretString::from(stored.access_token.trim().to_string()),
        })
    }
}

/// Loads credentials from a JSON file.
///
/// # Errors
///
/// Returns `AppError::Credential` if the file is missing, unreadable,
/// malformed, or has an empty token or project. The error message never
/// includes file contents.
pub async fn load_credentials(path: &Path) -> Result<WarehouseCredentials, AppError> {
    let path: PathBuf = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let json = std::fs::read_to_string(&path).map_err(|e| {
            AppError::Credential(format!(
                "Failed to read credential file {}: {}",
                path.display(),
                e.kind()
            ))
        })?;

        let stored: StoredCredentials = serde_json::from_str(&json)
            .map_err(|_| AppError::Credential("Failed to parse credential file.".into()))?;

        WarehouseCredentials::try_from(stored)
    })
    .await
    .map_err(|_| AppError::Internal("Credential task failed.".into()))?
}
