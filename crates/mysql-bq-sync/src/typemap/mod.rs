//! Type mapping from MySQL column types to destination logical types.
//!
//! Native type descriptors are first parsed into the closed [`NativeType`]
//! enumeration; the mapping to [`LogicalType`] is an exhaustive match over it,
//! so adding a variant without deciding its destination type does not compile.

use crate::core::{DestinationField, FieldMode, LogicalType, SourceColumn};

/// MySQL column type families, parsed from a descriptor such as
/// `"tinyint(1) unsigned"` or `"decimal(12,2)"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeType {
    /// Integer types. `width` is the declared display width, if any.
    Integer { width: Option<u32>, unsigned: bool },
    /// `BIT(n)`.
    Bit { width: u32 },
    Boolean,
    Decimal,
    Float,
    Year,
    /// CHAR, VARCHAR and the TEXT family.
    Text,
    Enum,
    Set,
    /// BINARY, VARBINARY and the BLOB family.
    Binary,
    Json,
    Date,
    Time,
    DateTime,
    Timestamp,
    /// Anything not recognized, kept verbatim.
    Other(String),
}

impl NativeType {
    /// Parse a native type descriptor. Never fails; unknown names become `Other`.
    pub fn parse(descriptor: &str) -> Self {
        let lower = descriptor.trim().to_ascii_lowercase();
        let unsigned = lower.contains("unsigned");
        let (base, params) = match lower.find('(') {
            Some(open) => {
                let close = lower[open..].find(')').map(|i| open + i).unwrap_or(lower.len());
                (lower[..open].trim(), Some(&lower[open + 1..close]))
            }
            None => (lower.split_whitespace().next().unwrap_or(""), None),
        };
        let width = params.and_then(|p| p.split(',').next()).and_then(|w| w.trim().parse().ok());

        match base {
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "serial" => {
                NativeType::Integer {
                    width: if base == "tinyint" { width } else { None },
                    unsigned,
                }
            }
            "bit" => NativeType::Bit {
                width: width.unwrap_or(1),
            },
            "bool" | "boolean" => NativeType::Boolean,
            "decimal" | "numeric" | "dec" | "fixed" => NativeType::Decimal,
            "float" | "double" | "double precision" | "real" => NativeType::Float,
            "year" => NativeType::Year,
            "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" | "nchar"
            | "nvarchar" => NativeType::Text,
            "enum" => NativeType::Enum,
            "set" => NativeType::Set,
            "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
                NativeType::Binary
            }
            "json" => NativeType::Json,
            "date" => NativeType::Date,
            "time" => NativeType::Time,
            "datetime" => NativeType::DateTime,
            "timestamp" => NativeType::Timestamp,
            _ => NativeType::Other(lower.clone()),
        }
    }

    /// Destination type for this native type.
    pub fn logical_type(&self) -> LogicalType {
        match self {
            NativeType::Integer {
                width: Some(1), ..
            } => LogicalType::Bool,
            // Unsigned values share the signed family; the destination has no unsigned type.
            NativeType::Integer { .. } => LogicalType::Int64,
            NativeType::Bit { width: 1 } => LogicalType::Bool,
            NativeType::Bit { .. } => LogicalType::Int64,
            NativeType::Boolean => LogicalType::Bool,
            NativeType::Decimal => LogicalType::Numeric,
            NativeType::Float => LogicalType::Float64,
            NativeType::Year => LogicalType::Int64,
            NativeType::Text | NativeType::Enum | NativeType::Set => LogicalType::String,
            NativeType::Binary => LogicalType::Bytes,
            NativeType::Json => LogicalType::String,
            NativeType::Date => LogicalType::Date,
            NativeType::Time => LogicalType::Time,
            NativeType::DateTime | NativeType::Timestamp => LogicalType::Timestamp,
            NativeType::Other(_) => LogicalType::String,
        }
    }
}

/// Map a native type descriptor to a destination logical type.
pub fn map(native_type: &str) -> LogicalType {
    NativeType::parse(native_type).logical_type()
}

/// Proposed destination field for a source column.
pub fn destination_field(column: &SourceColumn) -> DestinationField {
    let mode = if column.is_nullable {
        FieldMode::Nullable
    } else {
        FieldMode::Required
    };
    DestinationField::new(&column.name, map(&column.native_type), mode)
        .with_description(format!("MySQL: {}", column.native_type))
}

/// Proposed destination schema for a source table.
pub fn derive_schema(columns: &[SourceColumn]) -> Vec<DestinationField> {
    columns.iter().map(destination_field).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_types() {
        assert_eq!(map("int"), LogicalType::Int64);
        assert_eq!(map("int(11)"), LogicalType::Int64);
        assert_eq!(map("bigint unsigned"), LogicalType::Int64);
        assert_eq!(map("smallint(5) unsigned zerofill"), LogicalType::Int64);
        assert_eq!(map("mediumint"), LogicalType::Int64);
        assert_eq!(map("tinyint(4)"), LogicalType::Int64);
        assert_eq!(map("year"), LogicalType::Int64);
    }

    #[test]
    fn test_boolean_types() {
        assert_eq!(map("tinyint(1)"), LogicalType::Bool);
        assert_eq!(map("TINYINT(1) UNSIGNED"), LogicalType::Bool);
        assert_eq!(map("bit(1)"), LogicalType::Bool);
        assert_eq!(map("bit"), LogicalType::Bool);
        assert_eq!(map("boolean"), LogicalType::Bool);
        assert_eq!(map("bit(8)"), LogicalType::Int64);
    }

    #[test]
    fn test_numeric_types() {
        assert_eq!(map("decimal(12,2)"), LogicalType::Numeric);
        assert_eq!(map("numeric"), LogicalType::Numeric);
        assert_eq!(map("double"), LogicalType::Float64);
        assert_eq!(map("float(7,3)"), LogicalType::Float64);
    }

    #[test]
    fn test_string_and_binary_types() {
        assert_eq!(map("varchar(255)"), LogicalType::String);
        assert_eq!(map("longtext"), LogicalType::String);
        assert_eq!(map("enum('a','b')"), LogicalType::String);
        assert_eq!(map("set('x','y')"), LogicalType::String);
        assert_eq!(map("json"), LogicalType::String);
        assert_eq!(map("varbinary(16)"), LogicalType::Bytes);
        assert_eq!(map("longblob"), LogicalType::Bytes);
    }

    #[test]
    fn test_temporal_types() {
        assert_eq!(map("date"), LogicalType::Date);
        assert_eq!(map("time"), LogicalType::Time);
        assert_eq!(map("datetime(6)"), LogicalType::Timestamp);
        assert_eq!(map("timestamp"), LogicalType::Timestamp);
    }

    #[test]
    fn test_unknown_defaults_to_string() {
        assert_eq!(map("geometry"), LogicalType::String);
        assert_eq!(map(""), LogicalType::String);
        assert_eq!(
            NativeType::parse("point"),
            NativeType::Other("point".to_string())
        );
    }

    #[test]
    fn test_destination_field_carries_mode_and_description() {
        let column = SourceColumn {
            name: "activo".to_string(),
            native_type: "tinyint(1)".to_string(),
            is_nullable: false,
            default: Some("1".to_string()),
            max_length: None,
            precision: Some(3),
            scale: Some(0),
            ordinal_pos: 4,
        };
        let field = destination_field(&column);
        assert_eq!(field.name, "activo");
        assert_eq!(field.logical_type, LogicalType::Bool);
        assert_eq!(field.mode, FieldMode::Required);
        assert_eq!(field.description.as_deref(), Some("MySQL: tinyint(1)"));
    }
}
