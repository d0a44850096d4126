//! Expands a classified filter into the ordered partitions a job will query.

use std::fmt;

use chrono::NaiveDate;

use crate::error::AppError;
use crate::extract::filter::Filter;

/// One unit of extraction: a calendar day, a discrete value, or the whole table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionKey {
    WholeTable,
    Date(NaiveDate),
    Value(String),
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKey::WholeTable => write!(f, "whole table"),
            PartitionKey::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            PartitionKey::Value(value) => write!(f, "{}", value),
        }
    }
}

/// Enumerates partitions in the order they must be queried.
///
/// Date ranges yield every day from start to end inclusive, ascending.
/// Value sets keep their input order, which also fixes manifest order and
/// which partition is last.
///
/// # Errors
///
/// Returns `AppError::InvalidFilter` for a date range whose start is after its end.
pub fn enumerate_partitions(filter: &Filter) -> Result<Vec<PartitionKey>, AppError> {
    let keys = match filter {
        Filter::None => vec![PartitionKey::WholeTable],
        Filter::DateRange { start, end, .. } => {
            if start > end {
                return Err(AppError::InvalidFilter(format!(
                    "StartDate {} is after EndDate {}",
                    start, end
                )));
            }
            start
                .iter_days()
                .take_while(|day| day <= end)
                .map(PartitionKey::Date)
                .collect()
        }
        Filter::ValueSet { values, .. } => {
            values.iter().cloned().map(PartitionKey::Value).collect()
        }
        Filter::SingleValue { value, .. } => vec![PartitionKey::Value(value.clone())],
    };

    Ok(keys)
}
