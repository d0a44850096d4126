//! Per-job execution context shared by every partition of one job.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Local, NaiveDate};

use crate::extract::executor::WarehouseQuery;
use crate::extract::query_builder::ColumnTypeLookup;

/// Everything a partition needs besides its own key: the warehouse, the
/// column catalog, where files go, and the job identity used in file names.
#[derive(Clone)]
pub struct JobContext {
    pub warehouse: Arc<dyn WarehouseQuery>,
    pub columns: Arc<dyn ColumnTypeLookup>,
    pub output_dir: PathBuf,
    pub job_id: i64,
    /// Date the job runs on. Whole-table file names and the default end of a
    /// date range derive from it.
    pub run_date: NaiveDate,
    /// Prefix the positionally last partition's file with `EOT_`.
    pub mark_final_partition: bool,
}

impl JobContext {
    pub fn new(
        job_id: i64,
        warehouse: Arc<dyn WarehouseQuery>,
        columns: Arc<dyn ColumnTypeLookup>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            warehouse,
            columns,
            output_dir: output_dir.into(),
            job_id,
            run_date: Local::now().date_naive(),
            mark_final_partition: false,
        }
    }

    pub fn with_run_date(mut self, run_date: NaiveDate) -> Self {
        self.run_date = run_date;
        self
    }

    pub fn with_final_partition_marker(mut self, enabled: bool) -> Self {
        self.mark_final_partition = enabled;
        self
    }
}
