//! Core abstractions shared by every sync component.
//!
//! - [`schema`]: table identity plus source and destination column metadata
//! - [`value`]: decoded cell values, row sets and chunks
//! - [`traits`]: the source connection and warehouse seams
//! - [`identifier`]: identifier validation and quoting

pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{DestinationField, FieldMode, LogicalType, SourceColumn, TableSpec};
pub use traits::{SourceConnection, SourceConnector, Warehouse, WriteMode};
pub use value::{Chunk, RowSet, SqlValue};
