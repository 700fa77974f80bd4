use std::time::Duration;
use std::time::Instant;

use serde_json::Value;
use sqlx::Column;
use sqlx::Row;
use sqlx::TypeInfo;
use sqlx::ValueRef;
use sqlx::sqlite::SqliteRow;

use crate::Result;
use crate::StateError;

use super::ItemStore;

/// Columns, JSON-safe rows, and wall-clock time of a passthrough query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub elapsed: Duration,
}

impl ItemStore {
    /// Run `sql` verbatim against this store and return every row.
    ///
    /// No rewriting happens here; the caller owns the SQL. Byte columns are
    /// coerced to (lossy) strings so rows stay JSON-encodable.
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        let started = Instant::now();
        let rows = sqlx::query(sql)
            .fetch_all(self.pool())
            .await
            .map_err(StateError::Query)?;
        let elapsed = started.elapsed();

        let columns = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|column| column.name().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let rows = rows
            .iter()
            .map(row_to_values)
            .collect::<Result<Vec<_>>>()?;
        Ok(QueryResult {
            columns,
            rows,
            elapsed,
        })
    }
}

fn row_to_values(row: &SqliteRow) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(row.len());
    for index in 0..row.len() {
        values.push(column_value(row, index)?);
    }
    Ok(values)
}

fn column_value(row: &SqliteRow, index: usize) -> Result<Value> {
    let raw = row.try_get_raw(index).map_err(StateError::Query)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let value = match raw.type_info().name() {
        "INTEGER" => Value::from(row.try_get::<i64, _>(index).map_err(StateError::Query)?),
        "REAL" => Value::from(row.try_get::<f64, _>(index).map_err(StateError::Query)?),
        "BLOB" => {
            let bytes = row.try_get::<Vec<u8>, _>(index).map_err(StateError::Query)?;
            Value::from(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => Value::from(row.try_get::<String, _>(index).map_err(StateError::Query)?),
    };
    Ok(value)
}
