//! Runs one partition: build the query, execute it, and hand non-empty
//! results to the CSV writer under a deterministic file name.

use std::future::Future;
use std::pin::Pin;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::extract::context::JobContext;
use crate::extract::filter::{RowCap, TableRef};
use crate::extract::manifest::ManifestEntry;
use crate::extract::partition::PartitionKey;
use crate::extract::query_builder::{build_query, ColumnType};
use crate::streaming::write_csv;

// ─────────────────────────────────────────────────────────────────────────────
// Warehouse Seam
// ─────────────────────────────────────────────────────────────────────────────

/// Query result materialized as ordered string columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabularData {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TabularData {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Executes SQL against the warehouse.
///
/// The BigQuery client implements this for production; tests provide fakes
/// that return canned tables per query text.
pub trait WarehouseQuery: Send + Sync {
    fn run_query<'a>(
        &'a self,
        sql: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TabularData, AppError>> + Send + 'a>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Partition Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    First,
    Second,
}

/// Everything needed to run one partition.
#[derive(Debug, Clone, Copy)]
pub struct PartitionRequest<'a> {
    pub table: &'a TableRef,
    pub row_cap: RowCap,
    pub key: &'a PartitionKey,
    pub column: Option<&'a str>,
    pub column_type: Option<ColumnType>,
    /// True for the positionally last partition of the job.
    pub is_last: bool,
}

/// A successfully executed partition query.
#[derive(Debug, Clone)]
pub struct PartitionResult {
    pub key: PartitionKey,
    pub row_count: usize,
    /// Taken by the CSV writer once the partition is persisted.
    pub data: Option<TabularData>,
    pub attempt: Attempt,
}

/// What happened to one partition on one attempt.
#[derive(Debug)]
pub enum PartitionOutcome {
    /// CSV written; the entry belongs in the manifest.
    Written(ManifestEntry),
    /// Zero rows on the first attempt; run it again in the second pass.
    RetryPending,
    /// Zero rows on the second attempt. Terminal, not an error.
    ConfirmedEmpty,
    /// Query, column-type or output failure. Recorded as a job error.
    Failed(AppError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Execution
// ─────────────────────────────────────────────────────────────────────────────

/// Builds and executes the query for one partition.
///
/// # Errors
///
/// - `AppError::ColumnTypeLookup` if a date partition's column type is unknown
/// - `AppError::QueryExecution` for any warehouse failure
pub async fn run_partition_query(
    ctx: &JobContext,
    request: &PartitionRequest<'_>,
    attempt: Attempt,
) -> Result<PartitionResult, AppError> {
    let sql = build_query(
        request.table,
        request.row_cap,
        request.key,
        request.column,
        request.column_type,
    )?;

    debug!("[Extract] Partition {} query: {}", request.key, sql);

    let data = ctx
        .warehouse
        .run_query(&sql)
        .await
        .map_err(|e| AppError::QueryExecution {
            partition: request.key.to_string(),
            message: e.to_string(),
        })?;

    Ok(PartitionResult {
        key: request.key.clone(),
        row_count: data.row_count(),
        data: Some(data),
        attempt,
    })
}

/// Runs one partition end to end and classifies the outcome.
///
/// Failures never propagate: they come back as `PartitionOutcome::Failed`
/// so the remaining partitions still run.
pub async fn execute_partition(
    ctx: &JobContext,
    request: &PartitionRequest<'_>,
    attempt: Attempt,
) -> PartitionOutcome {
    let mut result = match run_partition_query(ctx, request, attempt).await {
        Ok(result) => result,
        Err(e) => {
            warn!("[Extract] Partition {} failed: {}", request.key, e);
            return PartitionOutcome::Failed(e);
        }
    };

    info!(
        "[Extract] Partition {} returned {} rows ({:?} attempt)",
        result.key, result.row_count, result.attempt
    );

    let whole_table = matches!(request.key, PartitionKey::WholeTable);
    if result.row_count == 0 {
        match attempt {
            Attempt::First => return PartitionOutcome::RetryPending,
            // A whole-table extraction always reports its file, even when empty.
            Attempt::Second if !whole_table => return PartitionOutcome::ConfirmedEmpty,
            Attempt::Second => {}
        }
    }

    let file_name = output_file_name(
        ctx.job_id,
        request.table,
        request.key,
        request.column,
        ctx.run_date,
        ctx.mark_final_partition && request.is_last,
    );
    let path = ctx.output_dir.join(&file_name);
    let data = result.data.take().unwrap_or_default();
    let rec_count = result.row_count as u64;

    let written = tokio::task::spawn_blocking(move || write_csv(&path, &data.columns, &data.rows))
        .await
        .map_err(|e| AppError::Internal(format!("CSV write task failed: {e}")))
        .and_then(|r| r);

    match written {
        Ok(path) => {
            info!("[Extract] Wrote {} rows to {}", rec_count, path.display());
            PartitionOutcome::Written(ManifestEntry {
                file_name,
                rec_count,
            })
        }
        Err(e) => {
            warn!("[Extract] Partition {} output failed: {}", request.key, e);
            PartitionOutcome::Failed(e)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output Naming
// ─────────────────────────────────────────────────────────────────────────────

/// Deterministic CSV file name for a partition.
///
/// - whole table: `<job>_<table>_<run date yyyyMMdd>.csv`
/// - date: `<job>_<table>_<date yyyyMMdd>.csv`
/// - value: `<job>_<table>_<column>_<value>.csv`
pub fn output_file_name(
    job_id: i64,
    table: &TableRef,
    key: &PartitionKey,
    column: Option<&str>,
    run_date: NaiveDate,
    final_marker: bool,
) -> String {
    let stem = match key {
        PartitionKey::WholeTable => format!("{}_{}_{}", job_id, table, run_date.format("%Y%m%d")),
        PartitionKey::Date(day) => format!("{}_{}_{}", job_id, table, day.format("%Y%m%d")),
        PartitionKey::Value(value) => format!(
            "{}_{}_{}_{}",
            job_id,
            table,
            column.unwrap_or_default(),
            value
        ),
    };

    let name = format!("{}.csv", sanitize_file_component(&stem));
    if final_marker {
        format!("EOT_{}", name)
    } else {
        name
    }
}

/// Replaces characters that are illegal in file names with `_`.
fn sanitize_file_component(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}
