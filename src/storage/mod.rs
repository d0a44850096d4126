//! Storage module for the local SQLite task queue and column catalog.

mod columns;
mod database;
mod tasks;

pub use columns::{upsert_column, SqliteColumnCatalog};
pub use database::Database;
pub use tasks::{claim_next_task, enqueue_task, get_task, mark_task_complete, QueuedTask, TaskStatus};
