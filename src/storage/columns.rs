//! Column catalog backed by the `warehouse_columns` table.

use std::future::Future;
use std::pin::Pin;

use rusqlite::OptionalExtension;
use tracing::debug;

use crate::error::AppError;
use crate::extract::{ColumnTypeLookup, TableRef};
use crate::storage::database::{open_connection, Database};

/// Resolves declared column types from the local catalog.
#[derive(Debug, Clone)]
pub struct SqliteColumnCatalog {
    db: Database,
}

impl SqliteColumnCatalog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn lookup(&self, table: &TableRef, column: &str) -> Result<Option<String>, AppError> {
        let db_path = self.db.db_path().clone();
        let table = table.clone();
        let column = column.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;

            let data_type: Option<String> = conn
                .query_row(
                    r#"
                    SELECT data_type FROM warehouse_columns
                    WHERE project_id = ?1 AND dataset_id = ?2 AND table_id = ?3
                      AND column_name = ?4 COLLATE NOCASE
                    "#,
                    rusqlite::params![table.project, table.dataset, table.table, column],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| AppError::Storage(format!("Failed to look up column type: {e}")))?;

            debug!("[Extract] Column {}.{} declared as {:?}", table, column, data_type);
            Ok::<_, AppError>(data_type.map(|t| t.trim().to_ascii_uppercase()))
        })
        .await
        .map_err(|e| AppError::Internal(format!("Column lookup task failed: {e}")))?
    }
}

impl ColumnTypeLookup for SqliteColumnCatalog {
    fn column_type<'a>(
        &'a self,
        table: &'a TableRef,
        column: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, AppError>> + Send + 'a>> {
        Box::pin(self.lookup(table, column))
    }
}

/// Inserts or replaces the declared type of one column.
pub async fn upsert_column(
    db: &Database,
    table: &TableRef,
    column: &str,
    data_type: &str,
) -> Result<(), AppError> {
    let db_path = db.db_path().clone();
    let table = table.clone();
    let column = column.to_string();
    let data_type = data_type.trim().to_string();

    if column.trim().is_empty() || data_type.is_empty() {
        return Err(AppError::InvalidJob(
            "Column name and data type must not be empty".into(),
        ));
    }

    tokio::task::spawn_blocking(move || {
        let conn = open_connection(&db_path)?;

        conn.execute(
            r#"
            INSERT INTO warehouse_columns (project_id, dataset_id, table_id, column_name, data_type)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (project_id, dataset_id, table_id, column_name)
            DO UPDATE SET data_type = excluded.data_type
            "#,
            rusqlite::params![table.project, table.dataset, table.table, column, data_type],
        )
        .map_err(|e| AppError::Storage(format!("Failed to upsert column: {e}")))?;

        Ok::<_, AppError>(())
    })
    .await
    .map_err(|e| AppError::Internal(format!("Upsert column task failed: {e}")))??;

    Ok(())
}
