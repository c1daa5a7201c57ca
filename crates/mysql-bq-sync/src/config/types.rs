//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source MySQL systems, one entry per system id.
    pub sources: Vec<SourceConfig>,

    /// BigQuery destination.
    pub destination: DestinationConfig,

    /// Run behaviour.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Per-table strategy records keyed by system id, then source table name.
    #[serde(default)]
    pub strategies: BTreeMap<String, BTreeMap<String, TableStrategyConfig>>,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.sync = self.sync.with_auto_tuning(&resources);
        self
    }

    /// Look up a source system by id.
    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// Strategy record for a table, if one is configured.
    pub fn strategy_for(&self, system_id: &str, table: &str) -> Option<&TableStrategyConfig> {
        self.strategies.get(system_id).and_then(|t| t.get(table))
    }
}

/// Source database (MySQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// System id used to key strategies and name destination tables.
    pub id: String,

    /// Database host.
    pub host: String,

    /// Database port (default: 3306).
    #[serde(default = "default_mysql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Environment variable holding the password, used when `password` is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// Prefix for destination table names (default: "<id>_").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_prefix: Option<String>,

    /// Pool size for this system (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connect timeout in seconds (default: 60).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl SourceConfig {
    /// Destination table prefix for this system.
    pub fn prefix(&self) -> String {
        self.table_prefix
            .clone()
            .unwrap_or_else(|| format!("{}_", self.id))
    }

    /// Password, resolved from the environment when configured that way.
    pub fn resolved_password(&self) -> String {
        if !self.password.is_empty() {
            return self.password.clone();
        }
        self.password_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_default()
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("password_env", &self.password_env)
            .field("table_prefix", &self.table_prefix)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Destination warehouse (BigQuery) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// GCP project id.
    pub project_id: String,

    /// Dataset receiving all tables (default: "plex_analytics").
    #[serde(default = "default_dataset")]
    pub dataset: String,

    /// Dataset location used on creation (default: "US").
    #[serde(default = "default_location")]
    pub location: String,

    /// Service account key file. Application default credentials when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<PathBuf>,

    /// Rows per staging INSERT statement (default: 10000).
    #[serde(default = "default_write_batch_rows")]
    pub write_batch_rows: usize,
}

/// Run behaviour configuration.
/// `workers` uses Option<T> to distinguish between "not set" (auto-tuned)
/// and "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Tables processed in parallel. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Default rows per chunk (default: 100000).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Default incremental lookback in days (default: 3).
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Treat every table as full refresh.
    #[serde(default)]
    pub force_full_refresh: bool,

    /// Attempts per chunk before it is skipped (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff delay in milliseconds, doubled per attempt (default: 1000).
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Pause between chunks in milliseconds (default: 500).
    #[serde(default = "default_chunk_pause_ms")]
    pub chunk_pause_ms: u64,

    /// Timeout for the COUNT(*) estimate in seconds (default: 5).
    #[serde(default = "default_count_timeout_secs")]
    pub count_timeout_secs: u64,

    /// Timeout for data queries in seconds (default: 300).
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    /// Timeout for destination writes and statements in seconds (default: 300).
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Consecutive skipped chunks that end an unbounded extraction (default: 3).
    #[serde(default = "default_max_consecutive_skips")]
    pub max_consecutive_skips: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: None,
            chunk_size: default_chunk_size(),
            lookback_days: default_lookback_days(),
            force_full_refresh: false,
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            chunk_pause_ms: default_chunk_pause_ms(),
            count_timeout_secs: default_count_timeout_secs(),
            query_timeout_secs: default_query_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            max_consecutive_skips: default_max_consecutive_skips(),
        }
    }
}

impl SyncConfig {
    /// Apply auto-tuned defaults based on system resources.
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        if self.workers.is_none() {
            let workers = (resources.cpu_cores / 2).clamp(1, 8);
            self.workers = Some(workers);
        }
        info!("Auto-tuned config: workers={}", self.get_workers());
        self
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn count_timeout(&self) -> Duration {
        Duration::from_secs(self.count_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn chunk_pause(&self) -> Duration {
        Duration::from_millis(self.chunk_pause_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Synchronization mode for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Replace the destination table with a full copy.
    #[default]
    FullRefresh,

    /// Delete the recent window in the destination and re-append it.
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::FullRefresh => write!(f, "full_refresh"),
            SyncMode::Incremental => write!(f, "incremental"),
        }
    }
}

/// Strategy record for one source table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableStrategyConfig {
    /// Sync mode (default: full_refresh).
    #[serde(default)]
    pub strategy: SyncMode,

    /// Watermark columns, OR-combined. A single string is accepted.
    #[serde(
        default,
        alias = "watermark_column",
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub watermark_columns: Vec<String>,

    /// Source query template used verbatim instead of the generated scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_query: Option<String>,

    /// Destination delete predicate template used instead of the generated one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_condition: Option<String>,

    /// Rows per chunk for this table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,

    /// Lookback in days for this table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookback_days: Option<u32>,

    /// Free-form note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(column)) => vec![column],
        Some(OneOrMany::Many(columns)) => columns,
    })
}

// Default value functions for serde
fn default_mysql_port() -> u16 {
    3306
}

fn default_max_connections() -> u32 {
    4
}

fn default_connect_timeout() -> u64 {
    60
}

fn default_dataset() -> String {
    "plex_analytics".to_string()
}

fn default_location() -> String {
    "US".to_string()
}

fn default_write_batch_rows() -> usize {
    10_000
}

fn default_chunk_size() -> usize {
    100_000
}

fn default_lookback_days() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_chunk_pause_ms() -> u64 {
    500
}

fn default_count_timeout_secs() -> u64 {
    5
}

fn default_query_timeout_secs() -> u64 {
    300
}

fn default_write_timeout_secs() -> u64 {
    300
}

fn default_max_consecutive_skips() -> u32 {
    3
}
