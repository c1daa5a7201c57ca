//! Concrete source and destination drivers.
//!
//! - [`mysql`]: MySQL/MariaDB sources over SQLx pools
//! - [`bigquery`]: the BigQuery destination
//!
//! Both implement the traits in [`crate::core`]; the engine never names a
//! driver type outside [`crate::orchestrator::Orchestrator::new`].

pub mod bigquery;
pub mod mysql;

pub use bigquery::BigQueryWarehouse;
pub use mysql::MySqlConnector;
