//! Job driver: classify the payload, enumerate partitions, resolve the
//! column type once, run both passes, and report a `JobOutcome`.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{AppError, ErrorSummary};
use crate::extract::context::JobContext;
use crate::extract::filter::{parse_job_spec, Filter, JobSpec};
use crate::extract::manifest::ManifestEntry;
use crate::extract::partition::{enumerate_partitions, PartitionKey};
use crate::extract::query_builder::ColumnType;
use crate::extract::retry::run_partitions;

/// Fixed task message for any job that recorded an error.
pub const FAILURE_MESSAGE: &str = "Errors generated. Contact developer for review.";

/// An error attributed to one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionError {
    pub partition: String,
    #[serde(flatten)]
    pub error: ErrorSummary,
}

impl PartitionError {
    pub fn new(key: &PartitionKey, error: &AppError) -> Self {
        Self {
            partition: key.to_string(),
            error: error.to_summary(),
        }
    }
}

/// Result of one job.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub total_records_found: u64,
    pub manifest: Vec<ManifestEntry>,
    pub errors: Vec<PartitionError>,
    /// Partitions that were empty on both attempts.
    pub confirmed_empty: Vec<String>,
    pub partitions_attempted: usize,
}

impl JobOutcome {
    /// True when at least one partition ran and none recorded an error.
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty() && self.partitions_attempted > 0
    }
}

/// Parses `payload` and runs the job it describes.
///
/// # Errors
///
/// Returns an error only for problems that stop the job before any query:
/// `AppError::InvalidJob` or `AppError::InvalidFilter`. Partition failures are
/// recorded in the returned `JobOutcome` instead.
pub async fn run_job(ctx: &JobContext, payload: &str) -> Result<JobOutcome, AppError> {
    let spec = parse_job_spec(payload, ctx.run_date)?;
    run_spec(ctx, &spec).await
}

/// Runs an already-validated job.
pub async fn run_spec(ctx: &JobContext, spec: &JobSpec) -> Result<JobOutcome, AppError> {
    let keys = enumerate_partitions(&spec.filter)?;

    info!(
        "[Extract] Job {} on {}: {} strategy, {} partition(s), limit {:?}",
        ctx.job_id,
        spec.table,
        spec.filter.strategy_name(),
        keys.len(),
        spec.row_cap.limit()
    );

    let column_type = resolve_column_type(ctx, spec).await;
    let outcome = run_partitions(ctx, spec, &keys, column_type).await;

    info!(
        "[Extract] Job {} finished: {} records in {} file(s), {} confirmed empty, {} error(s)",
        ctx.job_id,
        outcome.total_records_found,
        outcome.manifest.len(),
        outcome.confirmed_empty.len(),
        outcome.errors.len()
    );

    Ok(outcome)
}

/// Looks up the declared type of a date-range column once per job.
///
/// Returns `None` when the lookup fails or the column is unknown; every
/// date partition of the job then fails with `ColumnTypeLookup`.
async fn resolve_column_type(ctx: &JobContext, spec: &JobSpec) -> Option<ColumnType> {
    let Filter::DateRange { column, .. } = &spec.filter else {
        return None;
    };

    match ctx.columns.column_type(&spec.table, column).await {
        Ok(Some(declared)) => {
            let column_type = ColumnType::from_declared(&declared);
            info!(
                "[Extract] Column {} of {} is {} ({:?})",
                column, spec.table, declared, column_type
            );
            Some(column_type)
        }
        Ok(None) => {
            warn!(
                "[Extract] Column {} of {} is not in the column catalog; date partitions will be skipped",
                column, spec.table
            );
            None
        }
        Err(e) => {
            warn!(
                "[Extract] Column type lookup for {} of {} failed: {}",
                column, spec.table, e
            );
            None
        }
    }
}
