//! Two-pass partition driver.
//!
//! The first pass runs every partition in enumeration order and sets aside
//! those that came back empty. The second pass re-runs exactly those, once.
//! An empty second attempt is final: it is reported as confirmed-empty and
//! never retried again.

use tracing::{info, warn};

use crate::extract::context::JobContext;
use crate::extract::executor::{execute_partition, Attempt, PartitionOutcome, PartitionRequest};
use crate::extract::filter::{JobSpec, RowCap, TableRef};
use crate::extract::job::{JobOutcome, PartitionError};
use crate::extract::manifest::ManifestAggregator;
use crate::extract::partition::PartitionKey;
use crate::extract::query_builder::ColumnType;

/// A partition that returned zero rows on its first attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRetry {
    pub key: PartitionKey,
    /// Index in enumeration order.
    pub position: usize,
    pub table: TableRef,
    pub column: Option<String>,
    pub row_cap: RowCap,
}

impl PendingRetry {
    fn request(&self, column_type: Option<ColumnType>, last_position: usize) -> PartitionRequest<'_> {
        PartitionRequest {
            table: &self.table,
            row_cap: self.row_cap,
            key: &self.key,
            column: self.column.as_deref(),
            column_type,
            is_last: self.position == last_position,
        }
    }
}

/// Runs all partitions through both passes and accumulates the job outcome.
pub async fn run_partitions(
    ctx: &JobContext,
    spec: &JobSpec,
    keys: &[PartitionKey],
    column_type: Option<ColumnType>,
) -> JobOutcome {
    let mut manifest = ManifestAggregator::new();
    let mut errors: Vec<PartitionError> = Vec::new();
    let mut confirmed_empty: Vec<String> = Vec::new();
    let mut pending: Vec<PendingRetry> = Vec::new();
    let column = spec.filter.column();
    let last_position = keys.len().saturating_sub(1);

    // First pass
    for (position, key) in keys.iter().enumerate() {
        let request = PartitionRequest {
            table: &spec.table,
            row_cap: spec.row_cap,
            key,
            column,
            column_type,
            is_last: position == last_position,
        };

        match execute_partition(ctx, &request, Attempt::First).await {
            PartitionOutcome::Written(entry) => manifest.record(entry),
            PartitionOutcome::RetryPending => pending.push(PendingRetry {
                key: key.clone(),
                position,
                table: spec.table.clone(),
                column: column.map(str::to_string),
                row_cap: spec.row_cap,
            }),
            PartitionOutcome::ConfirmedEmpty => confirmed_empty.push(key.to_string()),
            PartitionOutcome::Failed(e) => errors.push(PartitionError::new(key, &e)),
        }
    }

    if !pending.is_empty() {
        info!(
            "[Extract] Retrying {} empty partition(s) of {}",
            pending.len(),
            spec.table
        );
    }

    // Second pass: terminal, nothing is queued again
    for retry in &pending {
        let request = retry.request(column_type, last_position);

        match execute_partition(ctx, &request, Attempt::Second).await {
            PartitionOutcome::Written(entry) => {
                // Header-only whole table: listed as confirmed empty and kept in the manifest.
                if entry.rec_count == 0 {
                    confirmed_empty.push(retry.key.to_string());
                }
                manifest.record(entry);
            }
            PartitionOutcome::ConfirmedEmpty | PartitionOutcome::RetryPending => {
                warn!(
                    "[Extract] Partition {} of {} is empty after retry",
                    retry.key, retry.table
                );
                confirmed_empty.push(retry.key.to_string());
            }
            PartitionOutcome::Failed(e) => errors.push(PartitionError::new(&retry.key, &e)),
        }
    }

    let (entries, total_records_found) = manifest.into_parts();
    JobOutcome {
        total_records_found,
        manifest: entries,
        errors,
        confirmed_empty,
        partitions_attempted: keys.len(),
    }
}
