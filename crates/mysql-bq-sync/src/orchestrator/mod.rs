//! Sync orchestrator - runs every selected table of every selected source.

use crate::config::Config;
use crate::core::{SourceConnector, TableSpec, Warehouse};
use crate::drivers::{BigQueryWarehouse, MySqlConnector};
use crate::error::{Result, SyncError, EXIT_CANCELLED, EXIT_PARTIAL_FAILURE};
use crate::load::{LoadPhase, TableLoader, TableOutcome, TablePlan, TableStatus};
use crate::strategy::SourceQuery;
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Sync orchestrator.
pub struct Orchestrator {
    config: Arc<Config>,
    connector: Arc<dyn SourceConnector>,
    warehouse: Arc<dyn Warehouse>,
    sources: Vec<String>,
    table: Option<(String, String)>,
    today: NaiveDate,
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Result of a sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: RunStatus,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// SHA-256 of the configuration the run used.
    pub config_hash: String,

    /// Total tables processed.
    pub tables_total: usize,

    /// Tables loaded completely.
    pub tables_success: usize,

    /// Tables that failed.
    pub tables_failed: usize,

    /// Total rows written to the destination.
    pub rows_loaded: u64,

    /// Failed tables as `system.table`.
    pub failed_tables: Vec<String>,

    /// Sources whose tables could not be listed, with the reason.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_errors: BTreeMap<String, String>,

    /// Per-table outcomes.
    pub tables: Vec<TableOutcome>,
}

impl RunResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Process exit code for this result.
    pub fn exit_code(&self) -> u8 {
        match self.status {
            RunStatus::Completed => 0,
            RunStatus::Partial | RunStatus::Failed => EXIT_PARTIAL_FAILURE,
            RunStatus::Cancelled => EXIT_CANCELLED,
        }
    }
}

/// Connectivity of one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub name: String,
    pub connected: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Health check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub sources: Vec<EndpointHealth>,
    pub destination: EndpointHealth,
    pub healthy: bool,
}

/// Row counts on both sides of one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableValidation {
    pub system_id: String,
    pub source_table: String,
    pub destination_table: String,
    pub source_rows: u64,
    /// `None` when the destination table does not exist.
    pub destination_rows: Option<u64>,
    pub matches: bool,
}

impl Orchestrator {
    /// Create an orchestrator backed by MySQL sources and BigQuery.
    pub async fn new(config: Config) -> Result<Self> {
        let connector = MySqlConnector::new(&config.sources, config.sync.query_timeout());
        let warehouse = BigQueryWarehouse::new(
            &config.destination,
            config.sync.write_timeout(),
        )
        .await?;
        Ok(Self::with_parts(config, Arc::new(connector), Arc::new(warehouse)))
    }

    /// Create an orchestrator over explicit source and destination clients.
    pub fn with_parts(
        config: Config,
        connector: Arc<dyn SourceConnector>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            warehouse,
            sources: Vec::new(),
            table: None,
            today: Utc::now().date_naive(),
        }
    }

    /// Restrict the run to these source systems.
    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }

    /// Restrict the run to a single table.
    pub fn with_table(mut self, system_id: impl Into<String>, table: impl Into<String>) -> Self {
        self.table = Some((system_id.into(), table.into()));
        self
    }

    /// Anchor incremental windows to a fixed day instead of today (UTC).
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn loader(&self) -> TableLoader {
        TableLoader::new(
            self.config.clone(),
            self.connector.clone(),
            self.warehouse.clone(),
        )
        .with_today(self.today)
    }

    fn selected_sources(&self) -> Result<Vec<&crate::config::SourceConfig>> {
        let mut wanted: Vec<&str> = self.sources.iter().map(String::as_str).collect();
        if let Some((system, _)) = &self.table {
            if !wanted.is_empty() && !wanted.contains(&system.as_str()) {
                return Err(SyncError::Config(format!(
                    "table selector system '{}' is not among the selected sources",
                    system
                )));
            }
            wanted = vec![system.as_str()];
        }

        if wanted.is_empty() {
            return Ok(self.config.sources.iter().collect());
        }
        wanted
            .iter()
            .map(|id| {
                self.config
                    .source(id)
                    .ok_or_else(|| SyncError::Config(format!("unknown source system '{}'", id)))
            })
            .collect()
    }

    /// Tables to synchronize, with per-source discovery failures.
    pub async fn discover(&self) -> Result<(Vec<TableSpec>, BTreeMap<String, String>)> {
        let mut specs = Vec::new();
        let mut failures = BTreeMap::new();

        for source in self.selected_sources()? {
            let prefix = source.prefix();
            if let Some((_, table)) = &self.table {
                specs.push(TableSpec::new(&source.id, table, &prefix));
                continue;
            }

            let listed = match self.connector.connect(&source.id).await {
                Ok(mut conn) => {
                    let tables = conn.list_tables().await;
                    conn.close().await;
                    tables
                }
                Err(e) => Err(e),
            };
            match listed {
                Ok(tables) => {
                    info!("{}: found {} tables", source.id, tables.len());
                    specs.extend(tables.iter().map(|t| TableSpec::new(&source.id, t, &prefix)));
                }
                Err(e) if e.is_run_fatal() => return Err(e),
                Err(e) => {
                    error!("{}: table discovery failed: {}", source.id, e);
                    failures.insert(source.id.clone(), e.to_string());
                }
            }
        }

        Ok((specs, failures))
    }

    /// Run the sync.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!("Starting sync run: {}", run_id);

        self.warehouse.create_dataset_if_absent().await?;

        let (specs, source_errors) = self.discover().await?;
        let workers = self.config.sync.get_workers();
        info!("{} tables to sync with {} workers", specs.len(), workers);

        // Child token: a run-fatal table error stops the remaining tables
        // without touching the caller's token.
        let run_cancel = cancel.child_token();
        let worker_slots = Arc::new(Semaphore::new(workers));
        // A table holds one source connection for its whole load.
        let source_slots: HashMap<&str, Arc<Semaphore>> = self
            .config
            .sources
            .iter()
            .map(|s| {
                let slots = usize::try_from(s.max_connections).unwrap_or(1).max(1);
                (s.id.as_str(), Arc::new(Semaphore::new(slots)))
            })
            .collect();
        let mut handles = Vec::with_capacity(specs.len());
        let mut outcomes = Vec::with_capacity(specs.len());

        for spec in specs {
            if run_cancel.is_cancelled() {
                outcomes.push(TableOutcome::cancelled(&spec));
                continue;
            }
            // Specs only name configured sources.
            let connections = source_slots
                .get(spec.system_id.as_str())
                .cloned()
                .unwrap_or_else(|| Arc::new(Semaphore::new(1)));

            let workers = worker_slots.clone();
            let loader = self.loader();
            let token = run_cancel.clone();
            let task_spec = spec.clone();
            let handle = tokio::spawn(async move {
                let permits: Result<_> = tokio::select! {
                    permits = acquire_slots(connections, workers) => permits,
                    _ = token.cancelled() => return Ok(TableOutcome::cancelled(&task_spec)),
                };
                let permits = match permits {
                    Ok(permits) => permits,
                    Err(e) => return Err(e),
                };
                let result = loader.load(&task_spec, &token).await;
                if let Err(e) = &result {
                    error!("{}: {}, cancelling remaining tables", task_spec, e);
                    token.cancel();
                }
                drop(permits);
                result
            });
            handles.push((spec, handle));
        }

        let mut fatal = None;
        for (spec, handle) in handles {
            match handle.await {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(e)) => {
                    outcomes.push(TableOutcome::failed(&spec, LoadPhase::Failed, &e));
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    error!("{}: task panicked - {}", spec, e);
                    let reason = format!("task panicked: {}", e);
                    outcomes.push(TableOutcome::failed(&spec, LoadPhase::Failed, &reason));
                }
            }
        }

        let completed_at = Utc::now();
        let result = summarize(
            run_id,
            started_at,
            completed_at,
            self.config.hash(),
            outcomes,
            source_errors,
            cancel.is_cancelled(),
        );

        info!(
            "Sync {}: {}/{} tables, {} rows in {:.1}s",
            result.status,
            result.tables_success,
            result.tables_total,
            result.rows_loaded,
            result.duration_seconds
        );
        if !result.failed_tables.is_empty() {
            warn!("Failed tables: {}", result.failed_tables.join(", "));
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        Ok(result)
    }

    /// Resolve and estimate every selected table without writing anything.
    pub async fn plan(&self) -> Result<Vec<TablePlan>> {
        let (specs, _) = self.discover().await?;
        let loader = self.loader();
        let mut plans = Vec::with_capacity(specs.len());
        for spec in &specs {
            match loader.plan(spec).await {
                Ok(plan) => plans.push(plan),
                Err(e) if e.is_run_fatal() => return Err(e),
                Err(e) => error!("{}: cannot plan: {}", spec, e),
            }
        }
        Ok(plans)
    }

    /// Check connectivity to every selected source and the destination.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let timeout = self.config.sync.count_timeout();
        let checks = self.selected_sources()?.into_iter().map(|source| async move {
            let start = Instant::now();
            let check = async {
                let mut conn = self.connector.connect(&source.id).await?;
                let result = conn.query("SELECT 1", timeout).await;
                conn.close().await;
                result.map(|_| ())
            };
            endpoint(&source.id, start, check.await)
        });
        let sources = join_all(checks).await;

        let start = Instant::now();
        let result = self.warehouse.ping().await;
        let destination = endpoint(
            &format!(
                "{}.{}",
                self.config.destination.project_id, self.config.destination.dataset
            ),
            start,
            result,
        );

        let healthy = destination.connected && sources.iter().all(|s| s.connected);
        Ok(HealthCheckResult {
            sources,
            destination,
            healthy,
        })
    }

    /// Compare source and destination row counts for every selected table.
    pub async fn validate(&self) -> Result<Vec<TableValidation>> {
        let (specs, _) = self.discover().await?;
        let timeout = self.config.sync.query_timeout();
        let mut results = Vec::with_capacity(specs.len());

        for spec in specs {
            let query = SourceQuery::generated(format!(
                "SELECT * FROM {}",
                crate::core::identifier::quote_mysql(&spec.source_table)?
            ));
            let mut conn = self.connector.connect(&spec.system_id).await?;
            let counted = conn.query(&query.count_sql(), timeout).await;
            conn.close().await;
            let source_rows = counted?
                .scalar()
                .and_then(count_value)
                .ok_or_else(|| {
                    SyncError::permanent(&spec.system_id, format!("{}: COUNT(*) returned no value", spec))
                })?;
            let destination_rows = self.warehouse.row_count(&spec.destination_table).await?;
            let matches = destination_rows == Some(source_rows);

            if matches {
                info!("{}: {} rows (match)", spec, source_rows);
            } else {
                warn!(
                    "{}: source={} destination={} (MISMATCH)",
                    spec,
                    source_rows,
                    destination_rows.map_or_else(|| "missing".to_string(), |n| n.to_string())
                );
            }

            results.push(TableValidation {
                system_id: spec.system_id,
                source_table: spec.source_table,
                destination_table: spec.destination_table,
                source_rows,
                destination_rows,
                matches,
            });
        }

        Ok(results)
    }
}

fn endpoint(name: &str, start: Instant, result: Result<()>) -> EndpointHealth {
    let latency_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(()) => EndpointHealth {
            name: name.to_string(),
            connected: true,
            latency_ms,
            error: None,
        },
        Err(e) => EndpointHealth {
            name: name.to_string(),
            connected: false,
            latency_ms,
            error: Some(e.to_string()),
        },
    }
}

fn count_value(value: &crate::core::SqlValue) -> Option<u64> {
    match value {
        crate::core::SqlValue::Int(n) => u64::try_from(*n).ok(),
        crate::core::SqlValue::Decimal(d) => d.to_string().parse().ok(),
        _ => None,
    }
}

/// Take a connection slot of the table's source, then a worker slot.
///
/// Connection slots are taken first: a worker slot is only held by a table
/// whose source has a connection free.
async fn acquire_slots(
    connections: Arc<Semaphore>,
    workers: Arc<Semaphore>,
) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
    let connection = connections
        .acquire_owned()
        .await
        .map_err(|_| SyncError::Cancelled)?;
    let worker = workers
        .acquire_owned()
        .await
        .map_err(|_| SyncError::Cancelled)?;
    Ok((connection, worker))
}

fn summarize(
    run_id: String,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    config_hash: String,
    tables: Vec<TableOutcome>,
    source_errors: BTreeMap<String, String>,
    cancelled: bool,
) -> RunResult {
    let duration_seconds = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
    let tables_success = tables
        .iter()
        .filter(|t| t.status == TableStatus::Completed)
        .count();
    let failed_tables: Vec<String> = tables
        .iter()
        .filter(|t| t.status == TableStatus::Failed)
        .map(|t| format!("{}.{}", t.system_id, t.source_table))
        .collect();
    let rows_loaded = tables.iter().map(|t| t.rows_loaded).sum();
    let any_partial = tables.iter().any(TableOutcome::is_partial);

    let status = if cancelled || tables.iter().any(|t| t.status == TableStatus::Cancelled) {
        RunStatus::Cancelled
    } else if !tables.is_empty() && tables_success == 0 {
        RunStatus::Failed
    } else if !failed_tables.is_empty() || any_partial || !source_errors.is_empty() {
        RunStatus::Partial
    } else {
        RunStatus::Completed
    };

    RunResult {
        run_id,
        status,
        duration_seconds,
        started_at,
        completed_at,
        config_hash,
        tables_total: tables.len(),
        tables_success,
        tables_failed: failed_tables.len(),
        rows_loaded,
        failed_tables,
        source_errors,
        tables,
    }
}
