//! Partition-and-extract engine.
//!
//! Turns one job payload into a set of CSV files and a manifest:
//!
//! - **filter** - payload parsing and strategy classification
//! - **partition** - ordered partition keys for a strategy
//! - **query_builder** - SQL per partition, column-type seam
//! - **executor** - runs one partition, writes its CSV
//! - **retry** - two-pass driver (empty partitions get one more attempt)
//! - **manifest** - manifest entries and the `ATGStats` file
//! - **job** - end-to-end driver producing a `JobOutcome`

mod context;
mod executor;
mod filter;
mod job;
mod manifest;
mod partition;
mod query_builder;
mod retry;

pub use context::JobContext;
pub use executor::{
    execute_partition, output_file_name, run_partition_query, Attempt, PartitionOutcome,
    PartitionRequest, PartitionResult, TabularData, WarehouseQuery,
};
pub use filter::{classify_filter, parse_job_spec, Filter, JobSpec, RowCap, TableRef, MIN_START_YEAR};
pub use job::{run_job, run_spec, JobOutcome, PartitionError, FAILURE_MESSAGE};
pub use manifest::{
    manifest_file_name, manifest_json, write_manifest, ManifestAggregator, ManifestEntry,
};
pub use partition::{enumerate_partitions, PartitionKey};
pub use query_builder::{build_query, ColumnType, ColumnTypeLookup};
pub use retry::{run_partitions, PendingRetry};
