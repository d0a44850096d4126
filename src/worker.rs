//! Polling worker: claims queued extraction tasks, runs them, and reports
//! each task's status and manifest back to the queue.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::AppError;
use crate::extract::{
    manifest_json, run_job, write_manifest, ColumnTypeLookup, JobContext, JobOutcome,
    PartitionError, WarehouseQuery, FAILURE_MESSAGE,
};
use crate::storage::{claim_next_task, mark_task_complete, Database, QueuedTask, SqliteColumnCatalog, TaskStatus};
use crate::warehouse::{load_credentials, BigQueryClient, QueryClient};

/// Final status, message and output JSON for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub status: TaskStatus,
    pub message: Option<String>,
    pub output_json: String,
}

impl TaskReport {
    /// Report for a job that ran; the manifest is included even on failure.
    pub fn from_outcome(outcome: &JobOutcome) -> Self {
        let output_json = manifest_json(&outcome.manifest).unwrap_or_else(|e| {
            warn!("[Worker] {}", e);
            "[]".to_string()
        });

        if outcome.succeeded() {
            Self {
                status: TaskStatus::Completed,
                message: None,
                output_json,
            }
        } else {
            Self {
                status: TaskStatus::Failed,
                message: Some(FAILURE_MESSAGE.to_string()),
                output_json,
            }
        }
    }

    /// Report for a job that stopped before producing a manifest.
    ///
    /// Rejected payloads and credentials are logged as warnings, anything else
    /// as an error.
    pub fn from_error(error: &AppError) -> Self {
        if error.is_fatal() {
            warn!("[Worker] Job rejected ({}): {}", error.kind(), error.operator_message());
        } else {
            error!("[Worker] Job failed ({}): {}", error.kind(), error.operator_message());
        }
        Self {
            status: TaskStatus::Failed,
            message: Some(FAILURE_MESSAGE.to_string()),
            output_json: "[]".to_string(),
        }
    }
}

/// Runs the polling loop until settings say stop.
///
/// Settings are re-read at the top of every iteration.
///
/// # Errors
///
/// Returns the configuration error that stopped the loop, if any.
pub async fn run_worker(config_path: &Path) -> Result<(), AppError> {
    info!("[Worker] Starting with settings from {}", config_path.display());

    loop {
        let settings = match Settings::load(config_path) {
            Ok(settings) => settings,
            Err(e) => {
                error!("[Worker] Settings could not be read, stopping: {}", e);
                return Err(e);
            }
        };

        if !settings.continue_running {
            info!("[Worker] continue_running is false, stopping");
            return Ok(());
        }

        match claim(&settings).await {
            Ok(Some((db, task))) => process_task(&settings, &db, &task).await,
            Ok(None) => {
                info!("[Worker] No task available, sleeping {}s", settings.wait_time_secs);
                tokio::time::sleep(Duration::from_secs(settings.wait_time_secs)).await;
            }
            Err(e) => {
                warn!("[Worker] Claim failed, treating as no task: {}", e);
                tokio::time::sleep(Duration::from_secs(settings.wait_time_secs)).await;
            }
        }
    }
}

async fn claim(settings: &Settings) -> Result<Option<(Database, QueuedTask)>, AppError> {
    let db = Database::init(settings.database_path.clone()).await?;
    let task = claim_next_task(
        &db,
        settings.task_type_id,
        &settings.node_name,
        settings.client_family_id,
    )
    .await?;
    Ok(task.map(|task| (db, task)))
}

/// Runs one claimed task end to end and records its terminal status.
pub async fn process_task(settings: &Settings, db: &Database, task: &QueuedTask) {
    let start = Instant::now();
    info!("[Worker] Task {} started", task.id);

    let report = match connect_warehouse(settings).await {
        Ok(warehouse) => extract_task(settings, db, task, Arc::new(warehouse)).await,
        Err(e) => TaskReport::from_error(&e),
    };

    if let Err(e) = mark_task_complete(
        db,
        task.id,
        report.status,
        report.message.as_deref(),
        Some(&report.output_json),
    )
    .await
    {
        error!("[Worker] Could not record result of task {}: {}", task.id, e);
    }

    info!(
        "[Worker] Task {} finished as {} in {:.2} minutes",
        task.id,
        report.status.as_str(),
        start.elapsed().as_secs_f64() / 60.0
    );
}

/// Runs a claimed task against `warehouse` and builds its report.
pub async fn extract_task(
    settings: &Settings,
    db: &Database,
    task: &QueuedTask,
    warehouse: Arc<dyn WarehouseQuery>,
) -> TaskReport {
    let columns = Arc::new(SqliteColumnCatalog::new(db.clone()));
    match run_single_job(settings, warehouse, columns, task.id, &task.parameters).await {
        Ok(outcome) => TaskReport::from_outcome(&outcome),
        Err(e) => TaskReport::from_error(&e),
    }
}

/// Loads credentials and builds the BigQuery query client.
pub async fn connect_warehouse(settings: &Settings) -> Result<QueryClient, AppError> {
    let mut creds = load_credentials(&settings.credentials_path).await?;
    if let Some(project_id) = &settings.warehouse.project_id {
        creds.project_id = project_id.clone();
    }
    let client = BigQueryClient::new(creds, &settings.warehouse)?;
    Ok(QueryClient::new(client, &settings.warehouse))
}

/// Runs one job and writes its manifest.
///
/// A manifest that cannot be written is recorded as an error in the outcome.
///
/// # Errors
///
/// Returns errors that stop the job before any query, plus an
/// `AppError::OutputPath` if the output directory cannot be created.
pub async fn run_single_job(
    settings: &Settings,
    warehouse: Arc<dyn WarehouseQuery>,
    columns: Arc<dyn ColumnTypeLookup>,
    job_id: i64,
    payload: &str,
) -> Result<JobOutcome, AppError> {
    tokio::fs::create_dir_all(&settings.output_dir)
        .await
        .map_err(|e| {
            AppError::OutputPath(format!(
                "Failed to create output directory {}: {}",
                settings.output_dir.display(),
                e
            ))
        })?;

    let ctx = JobContext::new(job_id, warehouse, columns, &settings.output_dir)
        .with_final_partition_marker(settings.mark_final_partition);

    let mut outcome = run_job(&ctx, payload).await?;

    match write_manifest(&settings.output_dir, job_id, &outcome.manifest).await {
        Ok(path) => info!("[Worker] Manifest written to {}", path.display()),
        Err(e) => {
            error!("[Worker] Manifest for job {} not written: {}", job_id, e);
            outcome.errors.push(PartitionError {
                partition: "manifest".into(),
                error: e.to_summary(),
            });
        }
    }

    Ok(outcome)
}
