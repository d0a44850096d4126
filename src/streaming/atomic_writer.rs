//! Atomic file writers with automatic cleanup on failure.
//!
//! Writes go to a temporary file in the same directory as the destination,
//! which atomically replaces the destination on `finish()`. If dropped
//! before finishing, the temporary file is removed, so a reader of the
//! export directory never sees a half-written CSV or manifest.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use csv::Writer;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::AppError;

/// An atomic CSV writer.
///
/// Writes to a temporary file and atomically persists to the final path
/// on `finish()`. If dropped without calling `finish()`, the temporary
/// file is deleted.
pub struct AtomicCsvWriter {
    writer: Writer<BufWriter<NamedTempFile>>,
    final_path: PathBuf,
}

impl AtomicCsvWriter {
    /// Creates a writer targeting `final_path`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::OutputPath` if the parent directory cannot be
    /// determined or the temporary file cannot be created there.
    pub fn new(final_path: impl AsRef<Path>) -> Result<Self, AppError> {
        let final_path = final_path.as_ref().to_path_buf();
        let temp_file = temp_file_beside(&final_path)?;

        Ok(Self {
            writer: Writer::from_writer(BufWriter::new(temp_file)),
            final_path,
        })
    }

    /// Writes one record, mapping CSV failures to `AppError::OutputPath`.
    pub fn write_record<I, T>(&mut self, record: I) -> Result<(), AppError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.writer.write_record(record).map_err(|e| {
            AppError::OutputPath(format!(
                "Failed to write CSV record for {}: {}",
                self.final_path.display(),
                e
            ))
        })
    }

    /// Flushes all buffers and atomically persists the file to the final path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::OutputPath` if flushing or persisting fails.
    /// The temporary file is cleaned up on error.
    pub fn finish(self) -> Result<PathBuf, AppError> {
        let buf_writer = self.writer.into_inner().map_err(|e| {
            AppError::OutputPath(format!("Failed to flush CSV writer: {}", e.error()))
        })?;

        let named_temp = buf_writer.into_inner().map_err(|e| {
            AppError::OutputPath(format!("Failed to flush buffer: {}", e.error()))
        })?;

        persist(named_temp, &self.final_path)?;
        Ok(self.final_path)
    }
}

/// Writes a header row and data rows to `path` atomically.
pub fn write_csv(path: &Path, columns: &[String], rows: &[Vec<String>]) -> Result<PathBuf, AppError> {
    let mut writer = AtomicCsvWriter::new(path)?;
    writer.write_record(columns)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer.finish()
}

/// Serializes `value` as pretty JSON and writes it to `path` atomically.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<PathBuf, AppError> {
    let temp_file = temp_file_beside(path)?;
    let mut buf_writer = BufWriter::new(temp_file);

    serde_json::to_writer_pretty(&mut buf_writer, value)
        .map_err(|e| AppError::OutputPath(format!("Failed to write JSON: {}", e)))?;
    buf_writer
        .flush()
        .map_err(|e| AppError::OutputPath(format!("Failed to flush buffer: {}", e)))?;

    let named_temp = buf_writer.into_inner().map_err(|e| {
        AppError::OutputPath(format!("Failed to flush buffer: {}", e.error()))
    })?;

    persist(named_temp, path)?;
    Ok(path.to_path_buf())
}

/// Creates a temporary file in the destination's directory (same filesystem).
fn temp_file_beside(final_path: &Path) -> Result<NamedTempFile, AppError> {
    let parent_dir = final_path.parent().ok_or_else(|| {
        AppError::OutputPath(format!(
            "Cannot determine parent directory for: {}",
            final_path.display()
        ))
    })?;

    NamedTempFile::new_in(parent_dir).map_err(|e| {
        AppError::OutputPath(format!(
            "Failed to create temporary file in {}: {}",
            parent_dir.display(),
            e
        ))
    })
}

fn persist(named_temp: NamedTempFile, final_path: &Path) -> Result<(), AppError> {
    named_temp.persist(final_path).map_err(|e| {
        AppError::OutputPath(format!(
            "Failed to persist file to {}: {}",
            final_path.display(),
            e.error
        ))
    })?;
    Ok(())
}
