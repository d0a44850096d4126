//! Queued extraction task persistence for SQLite.
//!
//! Workers claim the oldest pending task of their task type, run it, and
//! report a terminal status together with the manifest JSON.

use rusqlite::{OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::AppError;
use crate::storage::database::{current_timestamp, open_connection, Database};

// ─────────────────────────────────────────────────────────────────────────────
// TaskStatus Enum
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker.
    InProgress,
    /// Every partition succeeded.
    Completed,
    /// The job was rejected or at least one partition failed.
    Failed,
}

impl TaskStatus {
    /// Converts the status to its string representation for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::InProgress => "InProgress",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
        }
    }

    /// Parses a stored status. Unknown strings read as `Pending`.
    pub fn from_str(s: &str) -> Self {
        match s {
            "InProgress" => TaskStatus::InProgress,
            "Completed" => TaskStatus::Completed,
            "Failed" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DTOs
// ─────────────────────────────────────────────────────────────────────────────

/// One row of `queued_tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: i64,
    pub task_type: i64,
    pub client_family_id: Option<i64>,
    /// Raw job payload JSON.
    pub parameters: String,
    pub status: TaskStatus,
    pub machine_name: Option<String>,
    pub message: Option<String>,
    pub output_json: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

const TASK_COLUMNS: &str = "id, task_type, client_family_id, parameters, status, machine_name, message, output_json, created_at, updated_at";

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedTask> {
    let status: String = row.get(4)?;
    Ok(QueuedTask {
        id: row.get(0)?,
        task_type: row.get(1)?,
        client_family_id: row.get(2)?,
        parameters: row.get(3)?,
        status: TaskStatus::from_str(&status),
        machine_name: row.get(5)?,
        message: row.get(6)?,
        output_json: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Adds a pending task and returns its id.
pub async fn enqueue_task(
    db: &Database,
    task_type: i64,
    client_family_id: Option<i64>,
    parameters: &str,
) -> Result<i64, AppError> {
    let db_path = db.db_path().clone();
    let parameters = parameters.to_string();
    let now = current_timestamp();

    let id = tokio::task::spawn_blocking(move || {
        let conn = open_connection(&db_path)?;

        conn.execute(
            r#"
            INSERT INTO queued_tasks (task_type, client_family_id, parameters, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
            rusqlite::params![
                task_type,
                client_family_id,
                parameters,
                TaskStatus::Pending.as_str(),
                now,
            ],
        )
        .map_err(|e| AppError::Storage(format!("Failed to enqueue task: {e}")))?;

        Ok::<_, AppError>(conn.last_insert_rowid())
    })
    .await
    .map_err(|e| AppError::Internal(format!("Enqueue task failed: {e}")))??;

    info!("[Queue] Enqueued task {} (type {})", id, task_type);
    Ok(id)
}

/// Claims the oldest pending task of `task_type` for `machine`.
///
/// When `client_family_id` is set, only tasks of that family are eligible.
/// Selection and the move to `InProgress` happen in one immediate
/// transaction, so two workers never claim the same task.
pub async fn claim_next_task(
    db: &Database,
    task_type: i64,
    machine: &str,
    client_family_id: Option<i64>,
) -> Result<Option<QueuedTask>, AppError> {
    let db_path = db.db_path().clone();
    let machine = machine.to_string();
    let now = current_timestamp();

    let claimed = tokio::task::spawn_blocking(move || {
        let mut conn = open_connection(&db_path)?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| AppError::Storage(format!("Failed to start transaction: {e}")))?;

        let task = tx
            .query_row(
                &format!(
                    r#"
                    SELECT {TASK_COLUMNS} FROM queued_tasks
                    WHERE task_type = ?1 AND status = ?2
                      AND (?3 IS NULL OR client_family_id = ?3)
                    ORDER BY id ASC
                    LIMIT 1
                    "#
                ),
                rusqlite::params![task_type, TaskStatus::Pending.as_str(), client_family_id],
                task_from_row,
            )
            .optional()
            .map_err(|e| AppError::Storage(format!("Failed to select pending task: {e}")))?;

        let Some(mut task) = task else {
            return Ok::<_, AppError>(None);
        };

        tx.execute(
            "UPDATE queued_tasks SET status = ?1, machine_name = ?2, updated_at = ?3 WHERE id = ?4",
            rusqlite::params![TaskStatus::InProgress.as_str(), machine, now, task.id],
        )
        .map_err(|e| AppError::Storage(format!("Failed to claim task: {e}")))?;

        tx.commit()
            .map_err(|e| AppError::Storage(format!("Failed to commit claim: {e}")))?;

        task.status = TaskStatus::InProgress;
        task.machine_name = Some(machine);
        task.updated_at = now;
        Ok(Some(task))
    })
    .await
    .map_err(|e| AppError::Internal(format!("Claim task failed: {e}")))??;

    match &claimed {
        Some(task) => info!("[Queue] Claimed task {}", task.id),
        None => debug!("[Queue] No pending task of type {}", task_type),
    }
    Ok(claimed)
}

/// Records the final status of a task.
///
/// # Errors
///
/// - `AppError::Internal` if `status` is not terminal
/// - `AppError::Storage` if the task does not exist or the update fails
pub async fn mark_task_complete(
    db: &Database,
    task_id: i64,
    status: TaskStatus,
    message: Option<&str>,
    output_json: Option<&str>,
) -> Result<(), AppError> {
    if !status.is_terminal() {
        return Err(AppError::Internal(format!(
            "Cannot complete task {} with status {}",
            task_id,
            status.as_str()
        )));
    }

    let db_path = db.db_path().clone();
    let message = message.map(str::to_string);
    let output_json = output_json.map(str::to_string);
    let now = current_timestamp();

    tokio::task::spawn_blocking(move || {
        let conn = open_connection(&db_path)?;

        let updated = conn
            .execute(
                r#"
                UPDATE queued_tasks
                SET status = ?1, message = ?2, output_json = ?3, updated_at = ?4
                WHERE id = ?5
                "#,
                rusqlite::params![status.as_str(), message, output_json, now, task_id],
            )
            .map_err(|e| AppError::Storage(format!("Failed to complete task: {e}")))?;

        if updated == 0 {
            return Err(AppError::Storage(format!("Task {} not found", task_id)));
        }

        Ok::<_, AppError>(())
    })
    .await
    .map_err(|e| AppError::Internal(format!("Complete task failed: {e}")))??;

    info!("[Queue] Task {} marked {}", task_id, status.as_str());
    Ok(())
}

/// Gets a single task by id.
pub async fn get_task(db: &Database, task_id: i64) -> Result<Option<QueuedTask>, AppError> {
    let db_path = db.db_path().clone();

    tokio::task::spawn_blocking(move || {
        let conn = open_connection(&db_path)?;

        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM queued_tasks WHERE id = ?1"),
            [task_id],
            task_from_row,
        )
        .optional()
        .map_err(|e| AppError::Storage(format!("Failed to get task: {e}")))
    })
    .await
    .map_err(|e| AppError::Internal(format!("Get task failed: {e}")))?
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Database::init(temp_dir.path().join("test.db"))
            .await
            .expect("Failed to init DB");
        (temp_dir, db)
    }

    const PAYLOAD: &str = r#"{"TableName":"p.d.t","TOP":"-1","WhereClause":null}"#;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()), status);
        }
        assert_eq!(TaskStatus::from_str("garbage"), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn claim_returns_oldest_pending_of_type() {
        let (_dir, db) = test_db().await;

        let first = enqueue_task(&db, 7, None, PAYLOAD).await.unwrap();
        let _other_type = enqueue_task(&db, 8, None, PAYLOAD).await.unwrap();
        let second = enqueue_task(&db, 7, None, PAYLOAD).await.unwrap();

        let claimed = claim_next_task(&db, 7, "node-a", None).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, TaskStatus::InProgress);
        assert_eq!(claimed.machine_name.as_deref(), Some("node-a"));
        assert_eq!(claimed.parameters, PAYLOAD);

        let claimed = claim_next_task(&db, 7, "node-a", None).await.unwrap().unwrap();
        assert_eq!(claimed.id, second);

        assert!(claim_next_task(&db, 7, "node-a", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claimed_task_is_persisted_in_progress() {
        let (_dir, db) = test_db().await;
        let id = enqueue_task(&db, 1, None, PAYLOAD).await.unwrap();

        claim_next_task(&db, 1, "node-a", None).await.unwrap();

        let stored = get_task(&db, id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
        assert_eq!(stored.machine_name.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn claim_respects_client_family() {
        let (_dir, db) = test_db().await;

        let family_3 = enqueue_task(&db, 1, Some(3), PAYLOAD).await.unwrap();
        let family_4 = enqueue_task(&db, 1, Some(4), PAYLOAD).await.unwrap();

        let claimed = claim_next_task(&db, 1, "node-a", Some(4)).await.unwrap().unwrap();
        assert_eq!(claimed.id, family_4);
        assert!(claim_next_task(&db, 1, "node-a", Some(4)).await.unwrap().is_none());

        let claimed = claim_next_task(&db, 1, "node-b", None).await.unwrap().unwrap();
        assert_eq!(claimed.id, family_3);
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_task() {
        let (_dir, db) = test_db().await;
        for _ in 0..5 {
            enqueue_task(&db, 1, None, PAYLOAD).await.unwrap();
        }

        let mut handles = Vec::new();
        for n in 0..8 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                claim_next_task(&db, 1, &format!("node-{n}"), None).await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            if let Some(task) = handle.await.unwrap().unwrap() {
                ids.push(task.id);
            }
        }
        ids.sort_unstable();
        let before = ids.len();
        ids.dedup();
        assert_eq!(before, 5);
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn mark_complete_records_status_and_output() {
        let (_dir, db) = test_db().await;
        let id = enqueue_task(&db, 1, None, PAYLOAD).await.unwrap();
        claim_next_task(&db, 1, "node-a", None).await.unwrap();

        let manifest = r#"[{"FileName":"a.csv","RecCount":3}]"#;
        mark_task_complete(&db, id, TaskStatus::Failed, Some("Errors generated."), Some(manifest))
            .await
            .unwrap();

        let stored = get_task(&db, id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.message.as_deref(), Some("Errors generated."));
        assert_eq!(stored.output_json.as_deref(), Some(manifest));
    }

    #[tokio::test]
    async fn mark_complete_rejects_non_terminal_status_and_unknown_task() {
        let (_dir, db) = test_db().await;

        let result = mark_task_complete(&db, 1, TaskStatus::InProgress, None, None).await;
        assert!(matches!(result, Err(AppError::Internal(_))));

        let result = mark_task_complete(&db, 999, TaskStatus::Completed, None, Some("[]")).await;
        assert!(matches!(result, Err(AppError::Storage(_))));
    }
}
