//! Per-job manifest: one entry per output file, plus the running record total.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::streaming::write_json_atomic;

/// One produced output file and its row count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "FileName")]
    pub file_name: String,
    #[serde(rename = "RecCount")]
    pub rec_count: u64,
}

/// Accumulates manifest entries in the order partitions complete.
#[derive(Debug, Default)]
pub struct ManifestAggregator {
    entries: Vec<ManifestEntry>,
    total_records: u64,
}

impl ManifestAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: ManifestEntry) {
        self.total_records += entry.rec_count;
        self.entries.push(entry);
    }

    pub fn into_parts(self) -> (Vec<ManifestEntry>, u64) {
        (self.entries, self.total_records)
    }
}

/// File name of a job's manifest.
pub fn manifest_file_name(job_id: i64) -> String {
    format!("ATGStats{}.json", job_id)
}

/// Serializes the manifest as the JSON array reported back to the task queue.
pub fn manifest_json(entries: &[ManifestEntry]) -> Result<String, AppError> {
    serde_json::to_string(entries)
        .map_err(|e| AppError::Internal(format!("Failed to serialize manifest: {}", e)))
}

/// Writes the manifest array to `<output_dir>/ATGStats<job_id>.json`.
pub async fn write_manifest(
    output_dir: &Path,
    job_id: i64,
    entries: &[ManifestEntry],
) -> Result<PathBuf, AppError> {
    let path = output_dir.join(manifest_file_name(job_id));
    let entries = entries.to_vec();

    tokio::task::spawn_blocking(move || write_json_atomic(&path, &entries))
        .await
        .map_err(|e| AppError::Internal(format!("Manifest write task failed: {e}")))?
}
