//! Atomic output writers for partition CSVs and job manifests.

mod atomic_writer;

pub use atomic_writer::{write_csv, write_json_atomic, AtomicCsvWriter};
