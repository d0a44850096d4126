//! SQL text for one partition, plus the column-type lookup seam that decides
//! how date bounds are quoted.

use std::future::Future;
use std::pin::Pin;

use crate::error::AppError;
use crate::extract::filter::{RowCap, TableRef};
use crate::extract::partition::PartitionKey;

/// Declared type of a date-range column, as far as query building cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Dates stored as `yyyyMMdd` integers.
    Numeric,
    Other,
}

impl ColumnType {
    pub fn from_declared(type_name: &str) -> Self {
        if type_name.trim().eq_ignore_ascii_case("NUMERIC") {
            ColumnType::Numeric
        } else {
            ColumnType::Other
        }
    }
}

/// Resolves the declared data type of a warehouse column.
///
/// `Ok(None)` means the column is not catalogued.
pub trait ColumnTypeLookup: Send + Sync {
    fn column_type<'a>(
        &'a self,
        table: &'a TableRef,
        column: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, AppError>> + Send + 'a>>;
}

/// Builds the query for one partition.
///
/// # Errors
///
/// - `AppError::ColumnTypeLookup` for a date partition whose column type is unknown
/// - `AppError::InvalidFilter` for a date partition on the last representable day
/// - `AppError::Internal` for a filtered partition without a column
pub fn build_query(
    table: &TableRef,
    row_cap: RowCap,
    key: &PartitionKey,
    column: Option<&str>,
    column_type: Option<ColumnType>,
) -> Result<String, AppError> {
    let mut sql = format!("SELECT * FROM `{}`", table);

    match key {
        PartitionKey::WholeTable => {}
        PartitionKey::Date(day) => {
            let column = require_column(column, key)?;
            let column_type = column_type.ok_or_else(|| AppError::ColumnTypeLookup {
                table: table.to_string(),
                column: column.to_string(),
            })?;
            let next_day = day.succ_opt().ok_or_else(|| {
                AppError::InvalidFilter(format!("Date partition {} has no following day", day))
            })?;

            let (lower, upper) = match column_type {
                ColumnType::Numeric => (
                    day.format("%Y%m%d").to_string(),
                    next_day.format("%Y%m%d").to_string(),
                ),
                ColumnType::Other => (
                    format!("'{}'", day.format("%Y-%m-%d")),
                    format!("'{}'", next_day.format("%Y-%m-%d")),
                ),
            };
            sql.push_str(&format!(
                " WHERE {col} >= {lower} AND {col} < {upper}",
                col = column,
                lower = lower,
                upper = upper
            ));
        }
        PartitionKey::Value(value) => {
            let column = require_column(column, key)?;
            sql.push_str(&format!(" WHERE {} = '{}'", column, escape_literal(value)));
        }
    }

    if let Some(limit) = row_cap.limit() {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    Ok(sql)
}

fn require_column<'a>(column: Option<&'a str>, key: &PartitionKey) -> Result<&'a str, AppError> {
    column.ok_or_else(|| AppError::Internal(format!("Partition {} has no filter column", key)))
}

/// Escapes a value for a single-quoted string literal.
fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn table() -> TableRef {
        TableRef::parse("proj.sales.orders").unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> PartitionKey {
        PartitionKey::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    #[test]
    fn whole_table_with_limit() {
        let sql = build_query(&table(), RowCap::new(100), &PartitionKey::WholeTable, None, None)
            .unwrap();
        assert_eq!(sql, "SELECT * FROM `proj.sales.orders` LIMIT 100");
    }

    #[test]
    fn whole_table_without_limit() {
        for cap in [RowCap::unbounded(), RowCap::new(0)] {
            let sql = build_query(&table(), cap, &PartitionKey::WholeTable, None, None).unwrap();
            assert_eq!(sql, "SELECT * FROM `proj.sales.orders`");
        }
    }

    #[test]
    fn date_partition_quotes_bounds_for_non_numeric() {
        let sql = build_query(
            &table(),
            RowCap::unbounded(),
            &day(2024, 1, 31),
            Some("order_date"),
            Some(ColumnType::Other),
        )
        .unwrap();

        assert_eq!(
            sql,
            "SELECT * FROM `proj.sales.orders` WHERE order_date >= '2024-01-31' AND order_date < '2024-02-01'"
        );
    }

    #[test]
    fn date_partition_uses_integers_for_numeric() {
        let sql = build_query(
            &table(),
            RowCap::new(10),
            &day(2024, 12, 31),
            Some("date_key"),
            Some(ColumnType::Numeric),
        )
        .unwrap();

        assert_eq!(
            sql,
            "SELECT * FROM `proj.sales.orders` WHERE date_key >= 20241231 AND date_key < 20250101 LIMIT 10"
        );
    }

    #[test]
    fn date_partition_without_type_is_lookup_error() {
        let result = build_query(
            &table(),
            RowCap::unbounded(),
            &day(2024, 1, 1),
            Some("d"),
            None,
        );
        assert!(matches!(result, Err(AppError::ColumnTypeLookup { .. })));
    }

    #[test]
    fn last_representable_day_is_an_error_not_a_panic() {
        let result = build_query(
            &table(),
            RowCap::new(5),
            &PartitionKey::Date(NaiveDate::MAX),
            Some("d"),
            Some(ColumnType::Other),
        );
        assert!(matches!(result, Err(AppError::InvalidFilter(_))));
    }

    #[test]
    fn value_partition_escapes_quotes_and_backslashes() {
        let sql = build_query(
            &table(),
            RowCap::unbounded(),
            &PartitionKey::Value(r"O'Brien\x".into()),
            Some("name"),
            None,
        )
        .unwrap();

        assert_eq!(
            sql,
            r"SELECT * FROM `proj.sales.orders` WHERE name = 'O\'Brien\\x'"
        );
    }

    #[test]
    fn value_partition_with_limit() {
        let sql = build_query(
            &table(),
            RowCap::new(5),
            &PartitionKey::Value("A".into()),
            Some("c"),
            None,
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM `proj.sales.orders` WHERE c = 'A' LIMIT 5");
    }

    #[test]
    fn numeric_type_is_case_insensitive() {
        assert_eq!(ColumnType::from_declared("numeric"), ColumnType::Numeric);
        assert_eq!(ColumnType::from_declared(" NUMERIC "), ColumnType::Numeric);
        assert_eq!(ColumnType::from_declared("DATE"), ColumnType::Other);
        assert_eq!(ColumnType::from_declared("INT64"), ColumnType::Other);
    }
}
