//! SQL rendering for BigQuery chunk writes.
//!
//! A chunk is inserted into its own staging table with DML, then published to
//! the destination table with a single statement. DML-inserted rows never sit
//! in a streaming buffer, so later window deletes can touch them.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::core::identifier::{quote_bigquery, quote_literal};
use crate::core::{Chunk, DestinationField, FieldMode, LogicalType, SqlValue, WriteMode};
use crate::error::Result;
use crate::extract::format_interval;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Upper bound on one INSERT statement. BigQuery caps query text at 1024K characters.
const MAX_STATEMENT_BYTES: usize = 900 * 1024;

/// Staging tables left behind by a crashed run expire on their own.
const STAGING_OPTIONS: &str =
    "OPTIONS(expiration_timestamp=TIMESTAMP_ADD(CURRENT_TIMESTAMP(), INTERVAL 1 DAY))";

/// Statements that move one chunk into a destination table.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChunkStatements {
    /// Create the destination (APPEND) and the staging table.
    pub prepare: Vec<String>,

    /// Batched inserts into the staging table.
    pub inserts: Vec<String>,

    /// The only statement that touches the destination's rows.
    pub publish: String,

    pub cleanup: String,
}

/// Staging table name: _staging_<table>_<chunk index>
pub(crate) fn staging_table_name(table: &str, chunk_index: usize) -> String {
    format!("_staging_{}_{}", table, chunk_index)
}

/// Column definition for CREATE TABLE / ADD COLUMN.
pub(crate) fn column_ddl(field: &DestinationField) -> Result<String> {
    let mut ddl = format!("{} {}", quote_bigquery(&field.name)?, field.logical_type);
    if field.mode == FieldMode::Required {
        ddl.push_str(" NOT NULL");
    }
    if let Some(description) = &field.description {
        ddl.push_str(&format!(" OPTIONS(description={})", quote_literal(description)));
    }
    Ok(ddl)
}

fn column_list(schema: &[DestinationField]) -> Result<String> {
    Ok(schema
        .iter()
        .map(|f| quote_bigquery(&f.name))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

fn column_definitions(schema: &[DestinationField]) -> Result<String> {
    Ok(schema
        .iter()
        .map(column_ddl)
        .collect::<Result<Vec<_>>>()?
        .join(",\n  "))
}

/// Create the destination table from the attached schema when missing.
pub(crate) fn create_table_ddl(qualified: &str, schema: &[DestinationField]) -> Result<String> {
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
        qualified,
        column_definitions(schema)?
    ))
}

pub(crate) fn add_column_ddl(qualified: &str, field: &DestinationField) -> Result<String> {
    // Columns added to an existing table must be nullable.
    let field = DestinationField {
        mode: FieldMode::Nullable,
        ..field.clone()
    };
    Ok(format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
        qualified,
        column_ddl(&field)?
    ))
}

pub(crate) fn drop_not_null_ddl(qualified: &str, field: &DestinationField) -> Result<String> {
    Ok(format!(
        "ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL",
        qualified,
        quote_bigquery(&field.name)?
    ))
}

/// Every statement needed to write `chunk` into `target` through `staging`.
///
/// REPLACE builds the staging table from the attached schema and swaps the
/// destination for a copy of it. APPEND clones the destination's layout so
/// literals coerce to the column types actually stored there, then appends
/// the staged rows.
pub(crate) fn chunk_statements(
    target: &str,
    staging: &str,
    chunk: &Chunk,
    schema: &[DestinationField],
    mode: WriteMode,
    batch_rows: usize,
) -> Result<ChunkStatements> {
    let columns = column_list(schema)?;
    let (prepare, publish) = match mode {
        WriteMode::Replace => {
            let definitions = column_definitions(schema)?;
            (
                vec![format!(
                    "CREATE OR REPLACE TABLE {} (\n  {}\n) {}",
                    staging, definitions, STAGING_OPTIONS
                )],
                format!(
                    "CREATE OR REPLACE TABLE {} (\n  {}\n) AS SELECT {} FROM {}",
                    target, definitions, columns, staging
                ),
            )
        }
        WriteMode::Append => (
            vec![
                create_table_ddl(target, schema)?,
                format!(
                    "CREATE OR REPLACE TABLE {} LIKE {} {}",
                    staging, target, STAGING_OPTIONS
                ),
            ],
            format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                target, columns, columns, staging
            ),
        ),
    };

    Ok(ChunkStatements {
        prepare,
        inserts: insert_statements(staging, chunk, schema, batch_rows)?,
        publish,
        cleanup: format!("DROP TABLE IF EXISTS {}", staging),
    })
}

/// Pair each chunk column with its schema field.
///
/// Names match without regard to case, as destination columns do, and the
/// schema's spelling wins. Columns missing from the schema are dropped.
pub(crate) fn project<'a>(
    chunk: &Chunk,
    schema: &'a [DestinationField],
) -> Vec<(usize, &'a DestinationField)> {
    let mut projection: Vec<(usize, &DestinationField)> = Vec::with_capacity(chunk.columns.len());
    for (idx, name) in chunk.columns.iter().enumerate() {
        let Some(field) = schema.iter().find(|f| f.name.eq_ignore_ascii_case(name)) else {
            continue;
        };
        if projection.iter().any(|(_, seen)| seen.name == field.name) {
            continue;
        }
        projection.push((idx, field));
    }
    projection
}

/// INSERT ... VALUES statements holding at most `batch_rows` rows each.
pub(crate) fn insert_statements(
    staging: &str,
    chunk: &Chunk,
    schema: &[DestinationField],
    batch_rows: usize,
) -> Result<Vec<String>> {
    let projection = project(chunk, schema);
    if projection.is_empty() || chunk.rows.is_empty() {
        return Ok(Vec::new());
    }

    let names = projection
        .iter()
        .map(|(_, f)| quote_bigquery(&f.name))
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    let head = format!("INSERT INTO {} ({}) VALUES\n", staging, names);
    let batch_rows = batch_rows.max(1);

    let mut statements = Vec::new();
    let mut current = String::new();
    let mut rows_in_current = 0;
    for row in &chunk.rows {
        let tuple = row_tuple(row, &projection);
        let full = rows_in_current >= batch_rows
            || current.len() + tuple.len() + 2 > MAX_STATEMENT_BYTES;
        if rows_in_current > 0 && full {
            statements.push(std::mem::take(&mut current));
            rows_in_current = 0;
        }
        if rows_in_current == 0 {
            current.push_str(&head);
        } else {
            current.push_str(",\n");
        }
        current.push_str(&tuple);
        rows_in_current += 1;
    }
    if rows_in_current > 0 {
        statements.push(current);
    }
    Ok(statements)
}

fn row_tuple(row: &[SqlValue], projection: &[(usize, &DestinationField)]) -> String {
    let values: Vec<String> = projection
        .iter()
        .map(|(idx, field)| match row.get(*idx) {
            Some(value) => render_literal(value, field.logical_type),
            None => "NULL".to_string(),
        })
        .collect();
    format!("({})", values.join(", "))
}

/// Render a cell as a literal of its column type.
///
/// Temporal values are plain string literals, which BigQuery coerces to
/// DATE, TIME, DATETIME or TIMESTAMP on insert.
pub(crate) fn render_literal(value: &SqlValue, logical_type: LogicalType) -> String {
    match (logical_type, value) {
        (_, SqlValue::Null) => "NULL".to_string(),

        (LogicalType::Bool, SqlValue::Bool(b)) => bool_literal(*b),
        (LogicalType::Bool, SqlValue::Int(i)) => bool_literal(*i != 0),

        (LogicalType::Int64, SqlValue::Int(i)) => i.to_string(),
        (LogicalType::Int64, SqlValue::Bool(b)) => i64::from(*b).to_string(),

        (LogicalType::Float64, SqlValue::Float(f)) => float(*f),
        (LogicalType::Float64, SqlValue::Int(i)) => float(*i as f64),

        (LogicalType::Numeric, other) => format!("NUMERIC {}", quote_literal(&to_text(other))),

        (LogicalType::Date, SqlValue::DateTime(dt)) => {
            quote_literal(&dt.date().format(DATE_FORMAT).to_string())
        }
        (LogicalType::Timestamp, SqlValue::Date(d)) => {
            quote_literal(&format!("{} 00:00:00", d.format(DATE_FORMAT)))
        }
        (
            LogicalType::Date | LogicalType::Time | LogicalType::Timestamp | LogicalType::String,
            other,
        ) => quote_literal(&to_text(other)),

        (LogicalType::Bytes, SqlValue::Bytes(b)) => {
            format!("FROM_BASE64({})", quote_literal(&STANDARD.encode(b)))
        }
        (LogicalType::Bytes, other) => format!(
            "FROM_BASE64({})",
            quote_literal(&STANDARD.encode(to_text(other).as_bytes()))
        ),

        (_, other) => format!(
            "CAST({} AS {})",
            quote_literal(&to_text(other)),
            logical_type
        ),
    }
}

fn bool_literal(b: bool) -> String {
    let literal = if b { "TRUE" } else { "FALSE" };
    literal.to_string()
}

fn float(f: f64) -> String {
    if f.is_nan() {
        "NULL".to_string()
    } else if f.is_infinite() {
        let literal = if f > 0.0 { "inf" } else { "-inf" };
        format!("CAST('{}' AS FLOAT64)", literal)
    } else {
        // Debug output always carries a fraction or exponent.
        format!("{:?}", f)
    }
}

fn to_text(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => String::new(),
        SqlValue::Bool(b) => b.to_string(),
        SqlValue::Int(i) => i.to_string(),
        SqlValue::Float(f) => f.to_string(),
        SqlValue::Decimal(d) => d.normalize().to_string(),
        SqlValue::Text(s) => s.clone(),
        SqlValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        SqlValue::Date(d) => d.format(DATE_FORMAT).to_string(),
        SqlValue::Time(t) => t.format(TIME_FORMAT).to_string(),
        SqlValue::DateTime(dt) => dt.format(TIMESTAMP_FORMAT).to_string(),
        SqlValue::Interval(d) => format_interval(*d),
    }
}
