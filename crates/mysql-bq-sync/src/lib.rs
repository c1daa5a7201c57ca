//! # mysql-bq-sync
//!
//! Chunked MySQL to BigQuery synchronization library.
//!
//! This library copies tables from one or more MySQL/MariaDB systems into a
//! BigQuery dataset with support for:
//!
//! - **Full refresh** and **incremental** (lookback window) strategies per table
//! - **Chunked extraction** that tolerates missing or stale row counts
//! - **Retry with backoff** for transient source failures
//! - **Additive schema evolution** of destination tables
//! - **Parallel tables** bounded by a configurable worker count
//!
//! ## Example
//!
//! ```rust,no_run
//! use mysql_bq_sync::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mysql_bq_sync::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let result = orchestrator.run(CancellationToken::new()).await?;
//!     println!("Loaded {} rows", result.rows_loaded);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod estimate;
pub mod extract;
pub mod load;
pub mod orchestrator;
pub mod reconcile;
pub mod strategy;
pub mod typemap;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use config::{Config, DestinationConfig, SourceConfig, SyncConfig, SyncMode, TableStrategyConfig};
pub use error::{Result, SyncError};
pub use load::{LoadPhase, TableOutcome, TablePlan, TableStatus};
pub use orchestrator::{HealthCheckResult, Orchestrator, RunResult, RunStatus, TableValidation};
