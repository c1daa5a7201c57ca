//! Row decoding and error classification for MySQL results.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rust_decimal::Decimal;
use sqlx::mysql::{MySqlDatabaseError, MySqlRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::core::{RowSet, SqlValue};
use crate::error::SyncError;

/// Lock wait timeout, server gone away, lost connection, statement interrupted.
const TRANSIENT_ERROR_NUMBERS: [u16; 4] = [1205, 2006, 2013, 3024];

/// Server gone away, lost connection during query.
const CONNECTION_LOST_ERROR_NUMBERS: [u16; 2] = [2006, 2013];

/// Whether a MySQL server error number is worth retrying.
pub fn is_transient_error_number(number: u16) -> bool {
    TRANSIENT_ERROR_NUMBERS.contains(&number)
}

/// Map an SQLx error onto the sync error taxonomy.
pub fn classify_error(system: &str, err: sqlx::Error, context: &str) -> SyncError {
    let message = format!("{}: {}", context, err);
    match &err {
        sqlx::Error::PoolTimedOut => SyncError::PoolExhausted {
            system: system.to_string(),
            message,
        },
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            SyncError::connection_lost(system, message)
        }
        sqlx::Error::Database(db) => {
            match db.try_downcast_ref::<MySqlDatabaseError>().map(|e| e.number()) {
                Some(n) if CONNECTION_LOST_ERROR_NUMBERS.contains(&n) => {
                    SyncError::connection_lost(system, message)
                }
                Some(n) if is_transient_error_number(n) => SyncError::transient(system, message),
                _ => SyncError::permanent(system, message),
            }
        }
        _ => SyncError::permanent(system, message),
    }
}

/// Collect decoded rows with their column names.
pub(crate) fn rows_to_set(rows: &[MySqlRow]) -> RowSet {
    let columns = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let values = rows.iter().map(decode_row).collect();
    RowSet::new(columns, values)
}

fn decode_row(row: &MySqlRow) -> Vec<SqlValue> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| decode_cell(row, i, col.type_info().name()))
        .collect()
}

/// Decode one cell according to the result column's type name.
fn decode_cell(row: &MySqlRow, idx: usize, type_name: &str) -> SqlValue {
    let is_null = row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true);
    if is_null {
        return SqlValue::Null;
    }

    let decoded = match type_name {
        "BOOLEAN" => row.try_get::<bool, _>(idx).ok().map(SqlValue::Bool),

        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => row.try_get::<u64, _>(idx).ok().map(unsigned),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            row.try_get::<i64, _>(idx).ok().map(SqlValue::Int)
        }
        // YEAR travels as a two-byte integer but is not declared compatible.
        "YEAR" => row
            .try_get_unchecked::<u16, _>(idx)
            .ok()
            .map(|y| SqlValue::Int(i64::from(y))),
        "BIT" => row.try_get::<u64, _>(idx).ok().map(unsigned).or_else(|| {
            row.try_get_unchecked::<Vec<u8>, _>(idx)
                .ok()
                .map(|bytes| unsigned(bits_to_u64(&bytes)))
        }),

        "FLOAT" => row
            .try_get::<f32, _>(idx)
            .ok()
            .map(|v| SqlValue::Float(f64::from(v))),
        "DOUBLE" => row.try_get::<f64, _>(idx).ok().map(SqlValue::Float),
        "DECIMAL" => row.try_get::<Decimal, _>(idx).ok().map(SqlValue::Decimal),

        "DATE" => row.try_get::<NaiveDate, _>(idx).ok().map(SqlValue::Date),
        "TIME" => row
            .try_get::<NaiveTime, _>(idx)
            .ok()
            .map(|t| SqlValue::Interval(time_of_day(t))),
        "DATETIME" | "TIMESTAMP" => row
            .try_get::<NaiveDateTime, _>(idx)
            .ok()
            .map(SqlValue::DateTime),

        "JSON" => row
            .try_get::<serde_json::Value, _>(idx)
            .ok()
            .map(|v| SqlValue::Text(v.to_string())),

        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" | "GEOMETRY" => {
            row.try_get::<Vec<u8>, _>(idx).ok().map(SqlValue::Bytes)
        }

        _ => None,
    };

    decoded.unwrap_or_else(|| text_or_bytes(row, idx))
}

// Text columns, and anything the typed decoders rejected.
fn text_or_bytes(row: &MySqlRow, idx: usize) -> SqlValue {
    if let Ok(s) = row.try_get_unchecked::<String, _>(idx) {
        return SqlValue::Text(s);
    }
    match row.try_get_unchecked::<Vec<u8>, _>(idx) {
        Ok(bytes) => SqlValue::Text(String::from_utf8_lossy(&bytes).into_owned()),
        Err(_) => SqlValue::Null,
    }
}

/// Unsigned values beyond `i64` are carried as decimals.
fn unsigned(value: u64) -> SqlValue {
    match i64::try_from(value) {
        Ok(v) => SqlValue::Int(v),
        Err(_) => SqlValue::Decimal(Decimal::from(value)),
    }
}

/// Big-endian BIT payload to an integer.
fn bits_to_u64(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .take(8)
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn time_of_day(t: NaiveTime) -> chrono::Duration {
    chrono::Duration::seconds(i64::from(t.num_seconds_from_midnight()))
        + chrono::Duration::nanoseconds(i64::from(t.nanosecond()))
}
