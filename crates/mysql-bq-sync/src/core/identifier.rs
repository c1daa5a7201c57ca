//! Identifier validation and quoting for generated SQL.
//!
//! Table and column names cannot be bound as statement parameters, so every
//! identifier that reaches a generated statement goes through this module:
//! it is validated for suspicious content and then quoted for the target
//! engine. Both MySQL and BigQuery use backticks, but they escape an embedded
//! backtick differently.

use crate::error::{Result, SyncError};

/// Maximum identifier length accepted (BigQuery column names allow 300).
const MAX_IDENTIFIER_LENGTH: usize = 300;

/// Validate an identifier for security issues.
///
/// Rejects empty names, names containing null bytes, and names longer than
/// [`MAX_IDENTIFIER_LENGTH`].
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SyncError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(SyncError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(SyncError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a MySQL identifier using backticks, doubling embedded backticks.
///
/// ```ignore
/// assert_eq!(quote_mysql("users")?, "`users`");
/// assert_eq!(quote_mysql("table`name")?, "`table``name`");
/// ```
pub fn quote_mysql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("`{}`", name.replace('`', "``")))
}

/// Quote a BigQuery identifier using backticks, backslash-escaping embedded
/// backticks and backslashes.
pub fn quote_bigquery(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!(
        "`{}`",
        name.replace('\\', "\\\\").replace('`', "\\`")
    ))
}

/// Fully qualified BigQuery table path: `` `project.dataset.table` ``.
pub fn qualify_bigquery(project: &str, dataset: &str, table: &str) -> Result<String> {
    for part in [project, dataset, table] {
        validate_identifier(part)?;
        if part.contains('`') || part.contains('.') {
            return Err(SyncError::Config(format!(
                "BigQuery path component cannot contain '`' or '.': {:?}",
                part
            )));
        }
    }
    Ok(format!("`{}.{}.{}`", project, dataset, table))
}

/// Quote a string literal for MySQL or BigQuery standard SQL.
///
/// Line breaks are escaped because BigQuery rejects them inside
/// single-quoted literals.
pub fn quote_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            c => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}
