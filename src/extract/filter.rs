//! Job payload parsing and filter classification.
//!
//! A job payload names a table, an optional row cap and at most one filter
//! entry. The filter entry's shape decides the partitioning strategy:
//!
//! - object with `StartDate` / `EndDate` - one partition per calendar day
//! - array of scalars - one partition per value, in document order
//! - single scalar - one partition for that value
//! - absent, null or empty - the whole table in one partition

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Earliest start year accepted for a date-range filter.
pub const MIN_START_YEAR: i32 = 2015;

/// Latest year accepted at either end of a date-range filter.
pub const MAX_DATE_YEAR: i32 = 9999;

/// Start date assumed when a range omits `StartDate`.
/// Always fails the minimum-year check.
const MISSING_START_SENTINEL: (i32, u32, u32) = (1900, 1, 1);

const START_DATE_KEY: &str = "StartDate";
const END_DATE_KEY: &str = "EndDate";

// ─────────────────────────────────────────────────────────────────────────────
// Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireJobPayload {
    #[serde(rename = "TableName", default)]
    table_name: Option<String>,
    #[serde(rename = "TOP", default)]
    top: Option<Value>,
    #[serde(rename = "WhereClause", default)]
    where_clause: Option<Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// Fully-qualified warehouse table (`project.dataset.table`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    /// Parses a dotted three-part identifier.
    ///
    /// The name is quoted with backticks in SQL, so each part is limited to
    /// ASCII letters, digits, `_` and `-`.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let parts: Vec<&str> = raw.trim().split('.').collect();
        if parts.len() != 3 || !parts.iter().all(|p| is_table_part(p)) {
            return Err(AppError::InvalidJob(format!(
                "TableName must be project.dataset.table, got '{}'",
                raw
            )));
        }

        Ok(Self {
            project: parts[0].to_string(),
            dataset: parts[1].to_string(),
            table: parts[2].to_string(),
        })
    }
}

fn is_table_part(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Maximum rows to fetch per partition. Zero or negative means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowCap(i64);

impl RowCap {
    pub fn unbounded() -> Self {
        RowCap(-1)
    }

    pub fn new(value: i64) -> Self {
        RowCap(value)
    }

    /// Returns the `LIMIT` to apply, if any.
    pub fn limit(&self) -> Option<u64> {
        if self.0 > 0 {
            Some(self.0 as u64)
        } else {
            None
        }
    }

    /// Parses the payload's `TOP` field. Blank, null or unparseable values are unbounded.
    fn from_payload(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Number(n)) => n.as_i64().map(RowCap).unwrap_or_else(RowCap::unbounded),
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(RowCap)
                .unwrap_or_else(|_| RowCap::unbounded()),
            _ => RowCap::unbounded(),
        }
    }
}

/// The single partitioning strategy selected for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    None,
    DateRange {
        column: String,
        start: NaiveDate,
        end: NaiveDate,
    },
    ValueSet {
        column: String,
        values: Vec<String>,
    },
    SingleValue {
        column: String,
        value: String,
    },
}

impl Filter {
    pub fn column(&self) -> Option<&str> {
        match self {
            Filter::None => None,
            Filter::DateRange { column, .. }
            | Filter::ValueSet { column, .. }
            | Filter::SingleValue { column, .. } => Some(column),
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        match self {
            Filter::None => "whole-table",
            Filter::DateRange { .. } => "date-range",
            Filter::ValueSet { .. } => "value-set",
            Filter::SingleValue { .. } => "single-value",
        }
    }
}

/// A validated extraction job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub table: TableRef,
    pub row_cap: RowCap,
    pub filter: Filter,
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Parses a raw JSON job payload into a validated `JobSpec`.
///
/// `run_date` anchors the default end date of a date range (the day before).
///
/// # Errors
///
/// - `AppError::InvalidJob` if the payload is not JSON or `TableName` is missing/malformed
/// - `AppError::InvalidFilter` if the filter cannot be classified
pub fn parse_job_spec(payload: &str, run_date: NaiveDate) -> Result<JobSpec, AppError> {
    let wire: WireJobPayload = serde_json::from_str(payload)
        .map_err(|e| AppError::InvalidJob(format!("Job payload is not valid JSON: {}", e)))?;

    let table_name = wire
        .table_name
        .as_deref()
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| AppError::InvalidJob("TableName is missing".into()))?;

    let table = TableRef::parse(table_name)?;
    let row_cap = RowCap::from_payload(wire.top.as_ref());

    let filter = match wire.where_clause {
        None | Some(Value::Null) => Filter::None,
        Some(Value::Object(entries)) => classify_filter(&entries, run_date)?,
        Some(other) => {
            return Err(AppError::InvalidFilter(format!(
                "WhereClause must be an object, got {}",
                json_kind(&other)
            )))
        }
    };

    Ok(JobSpec {
        table,
        row_cap,
        filter,
    })
}

/// Classifies a `WhereClause` map into exactly one partitioning strategy.
pub fn classify_filter(entries: &Map<String, Value>, run_date: NaiveDate) -> Result<Filter, AppError> {
    let mut iter = entries.iter();
    let (column, value) = match (iter.next(), iter.next()) {
        (None, _) => return Ok(Filter::None),
        (Some(entry), None) => entry,
        (Some(_), Some(_)) => {
            return Err(AppError::InvalidFilter(format!(
                "WhereClause must contain a single column, found {}",
                entries.len()
            )))
        }
    };

    let column = validate_column(column)?;

    match value {
        Value::Object(range) => classify_date_range(column, range, run_date),
        Value::Array(items) => {
            if items.is_empty() {
                return Err(AppError::InvalidFilter(format!(
                    "Value list for column '{}' is empty",
                    column
                )));
            }
            let values = items
                .iter()
                .map(|item| {
                    scalar_to_string(item).ok_or_else(|| {
                        AppError::InvalidFilter(format!(
                            "Value list for column '{}' contains a {} element",
                            column,
                            json_kind(item)
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Filter::ValueSet { column, values })
        }
        Value::Null => Err(AppError::InvalidFilter(format!(
            "Column '{}' has no filter value",
            column
        ))),
        scalar => {
            let value = scalar_to_string(scalar).ok_or_else(|| {
                AppError::InvalidFilter(format!("Column '{}' has no filter value", column))
            })?;
            Ok(Filter::SingleValue { column, value })
        }
    }
}

fn classify_date_range(
    column: String,
    range: &Map<String, Value>,
    run_date: NaiveDate,
) -> Result<Filter, AppError> {
    let start_raw = lookup_key(range, START_DATE_KEY);
    let end_raw = lookup_key(range, END_DATE_KEY);

    if start_raw.is_none() && end_raw.is_none() {
        return Err(AppError::InvalidFilter(format!(
            "Column '{}' has an object value without StartDate or EndDate",
            column
        )));
    }

    let start = match date_field(start_raw, START_DATE_KEY)? {
        Some(date) => date,
        None => {
            let (y, m, d) = MISSING_START_SENTINEL;
            NaiveDate::from_ymd_opt(y, m, d)
                .ok_or_else(|| AppError::Internal("Invalid start sentinel".into()))?
        }
    };

    let end = match date_field(end_raw, END_DATE_KEY)? {
        Some(date) => date,
        None => run_date
            .checked_sub_signed(Duration::days(1))
            .ok_or_else(|| AppError::Internal("Run date has no previous day".into()))?,
    };

    if start.year() < MIN_START_YEAR {
        return Err(AppError::InvalidFilter(format!(
            "StartDate {} is before {}; the range is rejected",
            start, MIN_START_YEAR
        )));
    }

    if end.year() > MAX_DATE_YEAR {
        return Err(AppError::InvalidFilter(format!(
            "EndDate {} is after year {}",
            end, MAX_DATE_YEAR
        )));
    }

    if start > end {
        return Err(AppError::InvalidFilter(format!(
            "StartDate {} is after EndDate {}",
            start, end
        )));
    }

    Ok(Filter::DateRange { column, start, end })
}

/// Resolves one end of a range. `Ok(None)` means missing or blank.
fn date_field(raw: Option<&Value>, key: &str) -> Result<Option<NaiveDate>, AppError> {
    let text = match raw {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => {
            return Err(AppError::InvalidFilter(format!(
                "{} must be a date, got {}",
                key,
                json_kind(other)
            )))
        }
    };

    parse_date(&text)
        .map(Some)
        .ok_or_else(|| AppError::InvalidFilter(format!("{} '{}' is not a recognized date", key, text)))
}

/// Parses the date formats job payloads use in practice.
pub(crate) fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();

    if s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit()) {
        let year = s[0..4].parse().ok()?;
        let month = s[4..6].parse().ok()?;
        let day = s[6..8].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    for format in ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return Some(date);
        }
    }

    if let Ok(timestamp) = DateTime::parse_from_rfc3339(s) {
        return Some(timestamp.date_naive());
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(timestamp) = NaiveDateTime::parse_from_str(s, format) {
            return Some(timestamp.date());
        }
    }

    None
}

/// Column names are interpolated into SQL, so only plain identifiers are allowed.
fn validate_column(raw: &str) -> Result<String, AppError> {
    let column = raw.trim();
    let valid = !column.is_empty()
        && !column.starts_with('.')
        && !column.ends_with('.')
        && column
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');

    if !valid {
        return Err(AppError::InvalidFilter(format!(
            "Column name '{}' is not a plain identifier",
            raw
        )));
    }

    Ok(column.to_string())
}

fn lookup_key<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key).or_else(|| {
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
