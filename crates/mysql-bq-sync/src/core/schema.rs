//! Table identity and column metadata on both sides of a sync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One synchronization unit: a source table and the destination table it feeds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableSpec {
    /// Source system id.
    pub system_id: String,

    /// Table name in the source database.
    pub source_table: String,

    /// Table name in the destination dataset.
    pub destination_table: String,
}

impl TableSpec {
    /// Build a spec whose destination name is `<prefix><source_table>`.
    pub fn new(system_id: impl Into<String>, source_table: impl Into<String>, prefix: &str) -> Self {
        let source_table = source_table.into();
        Self {
            system_id: system_id.into(),
            destination_table: format!("{}{}", prefix, source_table),
            source_table,
        }
    }
}

impl fmt::Display for TableSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.system_id, self.source_table)
    }
}

/// Column metadata read from the source catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceColumn {
    /// Column name.
    pub name: String,

    /// Full native type, e.g. "tinyint(1)", "int unsigned", "varchar(255)".
    pub native_type: String,

    /// Whether the column accepts NULL.
    pub is_nullable: bool,

    /// Default expression, if any.
    pub default: Option<String>,

    /// Character length for string types.
    pub max_length: Option<i64>,

    /// Numeric precision.
    pub precision: Option<i64>,

    /// Numeric scale.
    pub scale: Option<i64>,

    /// 1-based position in the table.
    pub ordinal_pos: i32,
}

/// Column types available in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalType {
    String,
    Int64,
    Float64,
    Numeric,
    Bool,
    Date,
    Time,
    Timestamp,
    Bytes,
}

impl LogicalType {
    /// Destination DDL name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalType::String => "STRING",
            LogicalType::Int64 => "INT64",
            LogicalType::Float64 => "FLOAT64",
            LogicalType::Numeric => "NUMERIC",
            LogicalType::Bool => "BOOL",
            LogicalType::Date => "DATE",
            LogicalType::Time => "TIME",
            LogicalType::Timestamp => "TIMESTAMP",
            LogicalType::Bytes => "BYTES",
        }
    }

    /// Parse a type name reported by the destination catalog.
    ///
    /// Parameterized names such as `STRING(10)` or `NUMERIC(10, 2)` are
    /// accepted. Legacy aliases fold onto their standard names and anything
    /// unrecognized degrades to STRING.
    pub fn from_destination_name(name: &str) -> Self {
        let upper = name.trim().to_ascii_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim();
        match base {
            "INT64" | "INTEGER" | "INT" | "SMALLINT" | "BIGINT" | "TINYINT" | "BYTEINT" => {
                LogicalType::Int64
            }
            "FLOAT64" | "FLOAT" => LogicalType::Float64,
            "NUMERIC" | "DECIMAL" | "BIGNUMERIC" | "BIGDECIMAL" => LogicalType::Numeric,
            "BOOL" | "BOOLEAN" => LogicalType::Bool,
            "DATE" => LogicalType::Date,
            "TIME" => LogicalType::Time,
            "TIMESTAMP" | "DATETIME" => LogicalType::Timestamp,
            "BYTES" => LogicalType::Bytes,
            _ => LogicalType::String,
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field nullability in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    Nullable,
    Required,
}

impl FieldMode {
    /// The more permissive of two modes.
    pub fn widen(self, other: FieldMode) -> FieldMode {
        if self == FieldMode::Nullable || other == FieldMode::Nullable {
            FieldMode::Nullable
        } else {
            FieldMode::Required
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldMode::Nullable => "NULLABLE",
            FieldMode::Required => "REQUIRED",
        }
    }
}

/// A destination column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationField {
    pub name: String,
    pub logical_type: LogicalType,
    pub mode: FieldMode,
    pub description: Option<String>,
}

impl DestinationField {
    pub fn new(name: impl Into<String>, logical_type: LogicalType, mode: FieldMode) -> Self {
        Self {
            name: name.into(),
            logical_type,
            mode,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_spec_prefix() {
        let spec = TableSpec::new("plex", "factcabecera", "plex_");
        assert_eq!(spec.destination_table, "plex_factcabecera");
        assert_eq!(spec.to_string(), "plex.factcabecera");
    }

    #[test]
    fn test_logical_type_from_destination_name() {
        assert_eq!(LogicalType::from_destination_name("INT64"), LogicalType::Int64);
        assert_eq!(LogicalType::from_destination_name("STRING(255)"), LogicalType::String);
        assert_eq!(LogicalType::from_destination_name("NUMERIC(10, 2)"), LogicalType::Numeric);
        assert_eq!(LogicalType::from_destination_name("datetime"), LogicalType::Timestamp);
        assert_eq!(LogicalType::from_destination_name("BOOLEAN"), LogicalType::Bool);
        assert_eq!(LogicalType::from_destination_name("GEOGRAPHY"), LogicalType::String);
        assert_eq!(LogicalType::from_destination_name(""), LogicalType::String);
    }

    #[test]
    fn test_field_mode_widen() {
        use FieldMode::*;
        assert_eq!(Required.widen(Required), Required);
        assert_eq!(Required.widen(Nullable), Nullable);
        assert_eq!(Nullable.widen(Required), Nullable);
        assert_eq!(Nullable.widen(Nullable), Nullable);
    }
}
