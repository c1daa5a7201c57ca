//! Per-table load state machine.
//!
//! ```text
//! RESOLVE_STRATEGY -> DERIVE_SCHEMA -> RECONCILE_SCHEMA -> [DELETE_WINDOW] -> EXTRACT_LOAD_LOOP -> DONE
//!        \________________\___________________\__________________\__________________________-> FAILED
//! ```
//!
//! Within a table everything is sequential: chunk `i + 1` is fetched only after
//! chunk `i` was written or skipped. Chunk write failures and skipped windows
//! are recorded and the loop moves on; the prerequisites before the loop fail
//! the table.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, SyncMode};
use crate::core::{
    DestinationField, SourceConnection, SourceConnector, TableSpec, Warehouse, WriteMode,
};
use crate::error::{Result, SyncError};
use crate::estimate::{self, RowCountEstimate};
use crate::extract::{ChunkedExtractor, ExtractOptions};
use crate::reconcile;
use crate::strategy::{self, LoadMode, ResolvedStrategy, TableStrategy};
use crate::typemap;

/// States of the per-table load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadPhase {
    ResolveStrategy,
    DeriveSchema,
    ReconcileSchema,
    DeleteWindow,
    ExtractLoadLoop,
    Done,
    Failed,
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadPhase::ResolveStrategy => "RESOLVE_STRATEGY",
            LoadPhase::DeriveSchema => "DERIVE_SCHEMA",
            LoadPhase::ReconcileSchema => "RECONCILE_SCHEMA",
            LoadPhase::DeleteWindow => "DELETE_WINDOW",
            LoadPhase::ExtractLoadLoop => "EXTRACT_LOAD_LOOP",
            LoadPhase::Done => "DONE",
            LoadPhase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Final state of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Structured per-table result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableOutcome {
    pub system_id: String,
    pub source_table: String,
    pub destination_table: String,
    pub status: TableStatus,

    /// Mode actually used.
    pub strategy: SyncMode,

    /// Incremental was configured but could not be used.
    pub degraded: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate: Option<RowCountEstimate>,

    pub rows_loaded: u64,
    pub chunks_written: usize,
    pub chunks_skipped: usize,
    pub chunks_failed: usize,

    /// Phase that failed the table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<LoadPhase>,

    pub errors: Vec<String>,
    pub duration_seconds: f64,
}

impl TableOutcome {
    fn new(spec: &TableSpec) -> Self {
        Self {
            system_id: spec.system_id.clone(),
            source_table: spec.source_table.clone(),
            destination_table: spec.destination_table.clone(),
            status: TableStatus::Completed,
            strategy: SyncMode::FullRefresh,
            degraded: false,
            estimate: None,
            rows_loaded: 0,
            chunks_written: 0,
            chunks_skipped: 0,
            chunks_failed: 0,
            failed_phase: None,
            errors: Vec::new(),
            duration_seconds: 0.0,
        }
    }

    /// A table that failed outside the load state machine.
    pub fn failed(spec: &TableSpec, phase: LoadPhase, err: &dyn fmt::Display) -> Self {
        let mut outcome = Self::new(spec);
        outcome.fail(phase, err);
        outcome
    }

    /// A table that was never started because the run was cancelled.
    pub fn cancelled(spec: &TableSpec) -> Self {
        let mut outcome = Self::new(spec);
        outcome.status = TableStatus::Cancelled;
        outcome
    }

    fn fail(&mut self, phase: LoadPhase, err: &dyn fmt::Display) {
        self.status = TableStatus::Failed;
        self.failed_phase = Some(phase);
        self.errors.push(format!("{}: {}", phase, err));
    }

    /// Completed but with windows that did not reach the destination.
    pub fn is_partial(&self) -> bool {
        self.status == TableStatus::Completed && (self.chunks_skipped > 0 || self.chunks_failed > 0)
    }
}

/// What a load would do, without doing it.
#[derive(Debug, Clone, Serialize)]
pub struct TablePlan {
    pub system_id: String,
    pub source_table: String,
    pub destination_table: String,
    pub strategy: SyncMode,
    pub degraded: bool,
    pub load_mode: LoadMode,
    pub source_query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_predicate: Option<String>,
    pub chunk_size: usize,
    pub estimate: RowCountEstimate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planned_chunks: Option<u64>,
}

/// Runs the load state machine for single tables.
#[derive(Clone)]
pub struct TableLoader {
    config: Arc<Config>,
    connector: Arc<dyn SourceConnector>,
    warehouse: Arc<dyn Warehouse>,
    today: NaiveDate,
}

impl TableLoader {
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn SourceConnector>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            config,
            connector,
            warehouse,
            today: Utc::now().date_naive(),
        }
    }

    /// Anchor incremental windows to a fixed day.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    fn resolve(&self, spec: &TableSpec) -> Result<ResolvedStrategy> {
        let record = self.config.strategy_for(&spec.system_id, &spec.source_table);
        let strategy = TableStrategy::from_config(record, &self.config.sync);
        strategy::resolve(spec, &strategy, self.today)
    }

    /// Resolve and estimate a table without touching the destination.
    pub async fn plan(&self, spec: &TableSpec) -> Result<TablePlan> {
        let resolved = self.resolve(spec)?;
        let mut conn = self.connector.connect(&spec.system_id).await?;
        let estimate = estimate::estimate(
            conn.as_mut(),
            &resolved.source_query,
            &spec.source_table,
            self.config.sync.count_timeout(),
        )
        .await;
        conn.close().await;
        let estimate = estimate?;

        Ok(TablePlan {
            system_id: spec.system_id.clone(),
            source_table: spec.source_table.clone(),
            destination_table: spec.destination_table.clone(),
            strategy: resolved.mode,
            degraded: resolved.degraded,
            load_mode: resolved.load_mode,
            source_query: resolved.source_query.to_string(),
            delete_predicate: resolved.delete_predicate,
            chunk_size: resolved.chunk_size,
            planned_chunks: estimate.planned_chunks(resolved.chunk_size),
            estimate,
        })
    }

    /// Load one table.
    ///
    /// Returns `Err` only for run-fatal errors; every other failure is
    /// recorded in the outcome.
    pub async fn load(&self, spec: &TableSpec, cancel: &CancellationToken) -> Result<TableOutcome> {
        let start = Instant::now();
        let mut outcome = TableOutcome::new(spec);

        let mut conn = None;
        let result = self.run_phases(spec, cancel, &mut outcome, &mut conn).await;
        if let Some(conn) = conn {
            conn.close().await;
        }
        outcome.duration_seconds = start.elapsed().as_secs_f64();

        match result {
            Ok(()) => {}
            Err((_, e)) if e.is_run_fatal() => return Err(e),
            Err((phase, e)) => {
                error!("{}: failed in {}: {}", spec, phase, e);
                outcome.fail(phase, &e);
            }
        }

        match outcome.status {
            TableStatus::Completed => info!(
                "{}: done, {} rows loaded into {} ({} chunks written, {} skipped, {} failed)",
                spec,
                outcome.rows_loaded,
                spec.destination_table,
                outcome.chunks_written,
                outcome.chunks_skipped,
                outcome.chunks_failed
            ),
            TableStatus::Cancelled => warn!(
                "{}: cancelled after {} rows",
                spec, outcome.rows_loaded
            ),
            TableStatus::Failed => {}
        }
        Ok(outcome)
    }

    async fn run_phases(
        &self,
        spec: &TableSpec,
        cancel: &CancellationToken,
        outcome: &mut TableOutcome,
        conn_slot: &mut Option<Box<dyn SourceConnection>>,
    ) -> std::result::Result<(), (LoadPhase, SyncError)> {
        let sync = &self.config.sync;

        // RESOLVE_STRATEGY
        let resolved = self
            .resolve(spec)
            .map_err(|e| (LoadPhase::ResolveStrategy, e))?;
        outcome.strategy = resolved.mode;
        outcome.degraded = resolved.degraded;
        info!(
            "{}: {} ({}), chunk size {}",
            spec, resolved.mode, resolved.load_mode, resolved.chunk_size
        );

        // DERIVE_SCHEMA
        let phase = LoadPhase::DeriveSchema;
        let conn = conn_slot.insert(
            self.connector
                .connect(&spec.system_id)
                .await
                .map_err(|e| (phase, e))?,
        );
        let columns = conn
            .describe_table(&spec.source_table)
            .await
            .map_err(|e| (phase, e))?;
        if columns.is_empty() {
            return Err((
                phase,
                SyncError::permanent(
                    &spec.system_id,
                    format!("table '{}' not found or has no columns", spec.source_table),
                ),
            ));
        }
        let proposed = typemap::derive_schema(&columns);

        let mut query = resolved.source_query.clone();
        if !query.is_custom() {
            match conn.primary_key(&spec.source_table).await {
                Ok(key) if !key.is_empty() => {
                    query = query.with_ordering(&key).map_err(|e| (phase, e))?;
                }
                Ok(_) => warn!(
                    "{}: no primary key, pagination order is not guaranteed stable",
                    spec
                ),
                Err(e) => warn!("{}: primary key lookup failed: {}", spec, e),
            }
        }

        // RECONCILE_SCHEMA
        let phase = LoadPhase::ReconcileSchema;
        let existing = self
            .warehouse
            .get_table_schema(&spec.destination_table)
            .await
            .map_err(|e| (phase, e))?;
        reconcile::log_comparison(&spec.to_string(), existing.as_deref(), &proposed);
        let schema = reconcile::reconcile(existing.as_deref(), &proposed);
        let added = reconcile::added_fields(existing.as_deref(), &schema);
        if !added.is_empty() {
            info!(
                "{}: adding {} new field(s) to {}: {}",
                spec,
                added.len(),
                spec.destination_table,
                added.iter().map(|f| f.name.as_str()).collect::<Vec<_>>().join(", ")
            );
            self.warehouse
                .add_fields(&spec.destination_table, &added)
                .await
                .map_err(|e| (phase, e))?;
        }
        let relaxed = reconcile::relaxed_fields(existing.as_deref(), &schema);
        if !relaxed.is_empty() {
            info!(
                "{}: relaxing {} field(s) of {} to NULLABLE: {}",
                spec,
                relaxed.len(),
                spec.destination_table,
                relaxed.iter().map(|f| f.name.as_str()).collect::<Vec<_>>().join(", ")
            );
            self.warehouse
                .relax_fields(&spec.destination_table, &relaxed)
                .await
                .map_err(|e| (phase, e))?;
        }

        // DELETE_WINDOW
        if resolved.load_mode == LoadMode::Incremental {
            self.delete_window(spec, &resolved, existing.is_some())
                .await
                .map_err(|e| (LoadPhase::DeleteWindow, e))?;
        }

        // EXTRACT_LOAD_LOOP
        let phase = LoadPhase::ExtractLoadLoop;
        let estimate = estimate::estimate(
            conn.as_mut(),
            &query,
            &spec.source_table,
            sync.count_timeout(),
        )
        .await
        .map_err(|e| (phase, e))?;
        outcome.estimate = Some(estimate);
        info!(
            "{}: estimated {} rows ({:?})",
            spec, estimate.value, estimate.confidence
        );

        let Some(conn) = conn_slot.take() else {
            return Ok(());
        };
        let mut extractor = ChunkedExtractor::new(
            self.connector.as_ref(),
            conn,
            spec.to_string(),
            query,
            estimate,
            ExtractOptions::from_config(sync, resolved.chunk_size),
        );
        let result = self
            .extract_load(spec, &resolved, &schema, &mut extractor, cancel, outcome)
            .await;
        *conn_slot = extractor.into_connection();
        result.map_err(|e| (phase, e))
    }

    async fn delete_window(
        &self,
        spec: &TableSpec,
        resolved: &ResolvedStrategy,
        destination_exists: bool,
    ) -> Result<()> {
        if !destination_exists {
            info!(
                "{}: {} does not exist yet, nothing to delete",
                spec, spec.destination_table
            );
            return Ok(());
        }
        let Some(predicate) = &resolved.delete_predicate else {
            warn!(
                "{}: incremental load without a delete condition, rows will be appended",
                spec
            );
            return Ok(());
        };
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.warehouse.qualified_table(&spec.destination_table)?,
            predicate
        );
        info!("{}: deleting stale window: {}", spec, predicate);
        with_timeout(
            self.config.sync.write_timeout(),
            self.warehouse.execute_statement(&sql),
            || SyncError::Destination(format!("delete on {} timed out", spec.destination_table)),
        )
        .await
    }

    async fn extract_load(
        &self,
        spec: &TableSpec,
        resolved: &ResolvedStrategy,
        schema: &[DestinationField],
        extractor: &mut ChunkedExtractor<'_>,
        cancel: &CancellationToken,
        outcome: &mut TableOutcome,
    ) -> Result<()> {
        let planned = extractor
            .planned_chunks()
            .map_or_else(|| "?".to_string(), |n| n.to_string());
        let mut replace_pending = resolved.load_mode == LoadMode::Replace;

        loop {
            if cancel.is_cancelled() {
                outcome.status = TableStatus::Cancelled;
                return Ok(());
            }

            let chunk = match extractor.next_chunk().await? {
                None => return Ok(()),
                Some(Err(skipped)) => {
                    outcome.chunks_skipped += 1;
                    outcome.errors.push(skipped.to_string());
                    continue;
                }
                Some(Ok(chunk)) => chunk,
            };

            let mode = if replace_pending {
                WriteMode::Replace
            } else {
                WriteMode::Append
            };
            let written = with_timeout(
                self.config.sync.write_timeout(),
                self.warehouse
                    .write(&spec.destination_table, &chunk, schema, mode),
                || SyncError::write(&spec.destination_table, "write timed out"),
            )
            .await;

            match written {
                Ok(()) => {
                    replace_pending = false;
                    outcome.chunks_written += 1;
                    outcome.rows_loaded += chunk.len() as u64;
                    info!(
                        "{}: chunk {}/{} loaded ({} rows, {})",
                        spec,
                        chunk.index + 1,
                        planned,
                        chunk.len(),
                        mode
                    );
                }
                Err(e) => {
                    outcome.chunks_failed += 1;
                    outcome.errors.push(format!("chunk {}: {}", chunk.index, e));
                    warn!(
                        "{}: chunk {} write failed, continuing: {}",
                        spec, chunk.index, e
                    );
                }
            }
            debug!("{}: {} rows loaded so far", spec, outcome.rows_loaded);
        }
    }
}

async fn with_timeout<F>(
    limit: Duration,
    fut: F,
    on_timeout: impl FnOnce() -> SyncError,
) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}
