//! Core traits at the boundaries of the sync engine.
//!
//! - [`SourceConnector`] / [`SourceConnection`]: query and introspect a source system
//! - [`Warehouse`]: create, inspect and write destination tables
//!
//! The engine only talks to these traits, so the MySQL and BigQuery drivers
//! can be swapped for in-memory doubles in tests.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::schema::{DestinationField, SourceColumn};
use super::value::{Chunk, RowSet};

/// Opens connections to source systems.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Open (or check out) a connection to the given system.
    ///
    /// Fails with `PoolExhausted` when no connection can be acquired in time.
    async fn connect(&self, system_id: &str) -> Result<Box<dyn SourceConnection>>;

    /// Release pooled resources.
    async fn close(&self) {}
}

/// A live connection to one source system.
#[async_trait]
pub trait SourceConnection: Send {
    /// System id this connection belongs to.
    fn system_id(&self) -> &str;

    /// Run a query and collect all rows, failing once `timeout` elapses.
    async fn query(&mut self, sql: &str, timeout: Duration) -> Result<RowSet>;

    /// Base tables in the connected database.
    async fn list_tables(&mut self) -> Result<Vec<String>>;

    /// Columns of a table in ordinal order.
    async fn describe_table(&mut self, table: &str) -> Result<Vec<SourceColumn>>;

    /// Primary key columns in key order; empty when the table has none.
    async fn primary_key(&mut self, table: &str) -> Result<Vec<String>>;

    /// Row count from catalog statistics, when the catalog keeps one.
    async fn catalog_row_count(&mut self, table: &str) -> Result<Option<u64>>;

    /// Return the connection.
    async fn close(self: Box<Self>);
}

/// How a chunk write treats existing destination rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Discard existing contents, then write.
    Replace,
    /// Add rows to existing contents.
    Append,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::Replace => write!(f, "REPLACE"),
            WriteMode::Append => write!(f, "APPEND"),
        }
    }
}

/// Destination warehouse client.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Cheap round trip used by the health check.
    async fn ping(&self) -> Result<()>;

    /// Create the target dataset when it does not exist yet.
    async fn create_dataset_if_absent(&self) -> Result<()>;

    /// Current schema of a table, or `None` when the table does not exist.
    async fn get_table_schema(&self, table: &str) -> Result<Option<Vec<DestinationField>>>;

    /// Additive schema update: append the given fields to an existing table.
    async fn add_fields(&self, table: &str, fields: &[DestinationField]) -> Result<()>;

    /// Drop the NOT NULL constraint of existing fields.
    async fn relax_fields(&self, table: &str, fields: &[DestinationField]) -> Result<()>;

    /// Write one chunk. The schema is attached to every write.
    ///
    /// A chunk lands in full or not at all.
    async fn write(
        &self,
        table: &str,
        chunk: &Chunk,
        schema: &[DestinationField],
        mode: WriteMode,
    ) -> Result<()>;

    /// Execute a statement such as the delete of an incremental window.
    async fn execute_statement(&self, sql: &str) -> Result<()>;

    /// Fully qualified, quoted name of a table for use in statements.
    fn qualified_table(&self, table: &str) -> Result<String>;

    /// Number of rows in a table, `None` when it does not exist.
    async fn row_count(&self, table: &str) -> Result<Option<u64>>;
}
