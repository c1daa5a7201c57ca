//! Chunked extraction with retry and sanitization.
//!
//! [`ChunkedExtractor`] paginates a source query with `LIMIT`/`OFFSET`,
//! yielding one [`ChunkResult`] per window. A window whose fetch keeps failing
//! with transient errors is reported as [`ExtractionError::Skipped`] and the
//! extractor moves on to the next offset; non-transient errors end the
//! extraction through the outer `Result`.

mod retry;
mod sanitize;

pub use retry::RetryPolicy;
pub use sanitize::{format_interval, sanitize_chunk, sanitize_value, NULL_SENTINELS};

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::core::{Chunk, SourceConnection, SourceConnector};
use crate::error::{Result, SyncError};
use crate::estimate::{Confidence, RowCountEstimate};
use crate::strategy::SourceQuery;

/// A window that could not be extracted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("chunk {index} at offset {offset} skipped after {attempts} attempts: {reason}")]
    Skipped {
        index: usize,
        offset: u64,
        attempts: u32,
        reason: String,
    },
}

/// Outcome of one window.
pub type ChunkResult = std::result::Result<Chunk, ExtractionError>;

/// Extraction tuning.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub chunk_size: usize,
    pub retry: RetryPolicy,
    pub chunk_pause: Duration,
    pub query_timeout: Duration,
    pub max_consecutive_skips: u32,
}

impl ExtractOptions {
    pub fn from_config(sync: &SyncConfig, chunk_size: usize) -> Self {
        Self {
            chunk_size,
            retry: RetryPolicy::new(sync.max_retries, sync.retry_base_delay()),
            chunk_pause: sync.chunk_pause(),
            query_timeout: sync.query_timeout(),
            max_consecutive_skips: sync.max_consecutive_skips,
        }
    }
}

/// Lazy, single-pass pagination over a source query.
pub struct ChunkedExtractor<'a> {
    connector: &'a dyn SourceConnector,
    conn: Option<Box<dyn SourceConnection>>,
    system_id: String,
    label: String,
    query: SourceQuery,
    estimate: RowCountEstimate,
    options: ExtractOptions,
    index: usize,
    offset: u64,
    last_full: bool,
    consecutive_skips: u32,
    finished: bool,
}

impl<'a> ChunkedExtractor<'a> {
    /// Start at offset 0 using an already open connection.
    pub fn new(
        connector: &'a dyn SourceConnector,
        conn: Box<dyn SourceConnection>,
        label: impl Into<String>,
        query: SourceQuery,
        estimate: RowCountEstimate,
        options: ExtractOptions,
    ) -> Self {
        Self {
            connector,
            system_id: conn.system_id().to_string(),
            conn: Some(conn),
            label: label.into(),
            query,
            estimate,
            options,
            index: 0,
            offset: 0,
            last_full: true,
            consecutive_skips: 0,
            finished: false,
        }
    }

    /// Chunks the estimate implies, for progress reporting.
    pub fn planned_chunks(&self) -> Option<u64> {
        self.estimate.planned_chunks(self.options.chunk_size)
    }

    /// Fetch the next window.
    ///
    /// Returns `Ok(None)` once the result set is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<ChunkResult>> {
        if self.finished || self.is_exhausted() {
            self.finished = true;
            return Ok(None);
        }

        if self.index > 0 && !self.options.chunk_pause.is_zero() {
            tokio::time::sleep(self.options.chunk_pause).await;
        }

        let index = self.index;
        let offset = self.offset;
        let sql = self.query.paginated(self.options.chunk_size, offset);
        self.index += 1;
        self.offset += self.options.chunk_size as u64;

        match self.fetch_with_retry(&sql, index, offset).await? {
            Ok(mut chunk) => {
                self.consecutive_skips = 0;
                self.last_full = chunk.len() >= self.options.chunk_size;
                if chunk.is_empty() {
                    self.finished = true;
                    return Ok(None);
                }
                sanitize_chunk(&mut chunk);
                debug!(
                    "{}: chunk {} extracted ({} rows at offset {})",
                    self.label,
                    index,
                    chunk.len(),
                    offset
                );
                Ok(Some(Ok(chunk)))
            }
            Err(skipped) => {
                self.consecutive_skips += 1;
                self.last_full = true;
                warn!("{}: {}", self.label, skipped);
                if self.estimate.confidence != Confidence::Exact
                    && self.consecutive_skips >= self.options.max_consecutive_skips.max(1)
                {
                    warn!(
                        "{}: {} consecutive chunks skipped, ending extraction",
                        self.label, self.consecutive_skips
                    );
                    self.finished = true;
                }
                Ok(Some(Err(skipped)))
            }
        }
    }

    /// Give back the connection, if one is still open.
    pub fn into_connection(self) -> Option<Box<dyn SourceConnection>> {
        self.conn
    }

    fn is_exhausted(&self) -> bool {
        if !self.last_full {
            return true;
        }
        match self.estimate.confidence {
            Confidence::Exact => {
                self.index as u64 >= self.planned_chunks().unwrap_or(0)
            }
            // Approximate and unknown estimates read until a short chunk.
            Confidence::Approximate | Confidence::Unknown => false,
        }
    }

    async fn fetch_with_retry(
        &mut self,
        sql: &str,
        index: usize,
        offset: u64,
    ) -> Result<ChunkResult> {
        let policy = self.options.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.fetch_once(sql).await {
                Ok(rows) => return Ok(Ok(Chunk::from_rows(index, offset, rows))),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            // The connection may be dead; drop it and reconnect on the next attempt.
            if let Some(conn) = self.conn.take() {
                conn.close().await;
            }

            match policy.delay_after(attempt) {
                Some(delay) => {
                    warn!(
                        "{}: chunk {} attempt {}/{} failed, retrying in {:?}: {}",
                        self.label, index, attempt, policy.max_attempts, delay, error
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Ok(Err(ExtractionError::Skipped {
                        index,
                        offset,
                        attempts: attempt,
                        reason: error.to_string(),
                    }));
                }
            }
        }
    }

    async fn fetch_once(&mut self, sql: &str) -> Result<crate::core::RowSet> {
        if self.conn.is_none() {
            info!("{}: reconnecting to {}", self.label, self.system_id);
            self.conn = Some(self.connector.connect(&self.system_id).await?);
        }
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| SyncError::connection_lost(&self.system_id, "no connection"))?;
        debug!("{}: {}", self.label, sql);
        conn.query(sql, self.options.query_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlValue;
    use crate::testing::{FakeSource, FakeTable, QueryFailure};

    fn options(chunk_size: usize) -> ExtractOptions {
        ExtractOptions {
            chunk_size,
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
            chunk_pause: Duration::ZERO,
            query_timeout: Duration::from_secs(5),
            max_consecutive_skips: 3,
        }
    }

    fn query() -> SourceQuery {
        SourceQuery::generated("SELECT * FROM `orders`")
            .with_ordering(&["id".to_string()])
            .unwrap()
    }

    async fn drain(extractor: &mut ChunkedExtractor<'_>) -> Result<Vec<ChunkResult>> {
        let mut out = Vec::new();
        while let Some(result) = extractor.next_chunk().await? {
            out.push(result);
        }
        Ok(out)
    }

    fn ids(results: &[ChunkResult]) -> Vec<i64> {
        results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .flat_map(|c| c.rows.iter())
            .map(|row| match row[0] {
                SqlValue::Int(id) => id,
                _ => panic!("unexpected id"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_exact_estimate_bounds_chunks() {
        let source = FakeSource::new();
        source.add_table(FakeTable::with_rows("orders", 25));
        let connector = source.connector();
        let conn = connector.connect("plex").await.unwrap();
        let mut extractor = ChunkedExtractor::new(
            &connector,
            conn,
            "plex.orders",
            query(),
            RowCountEstimate::exact(25),
            options(10),
        );
        assert_eq!(extractor.planned_chunks(), Some(3));
        let results = drain(&mut extractor).await.unwrap();
        let sizes: Vec<usize> = results.iter().map(|r| r.as_ref().unwrap().len()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(ids(&results), (0..25).collect::<Vec<_>>());
        assert_eq!(source.data_queries().len(), 3);
        assert!(source.data_queries()[2].ends_with("ORDER BY `id` LIMIT 10 OFFSET 20"));
    }

    #[tokio::test]
    async fn test_exact_zero_issues_no_query() {
        let source = FakeSource::new();
        source.add_table(FakeTable::with_rows("orders", 0));
        let connector = source.connector();
        let conn = connector.connect("plex").await.unwrap();
        let mut extractor = ChunkedExtractor::new(
            &connector,
            conn,
            "plex.orders",
            query(),
            RowCountEstimate::exact(0),
            options(10),
        );
        assert!(drain(&mut extractor).await.unwrap().is_empty());
        assert!(source.data_queries().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_reads_until_empty() {
        let source = FakeSource::new();
        source.add_table(FakeTable::with_rows("orders", 30));
        let connector = source.connector();
        let conn = connector.connect("plex").await.unwrap();
        let mut extractor = ChunkedExtractor::new(
            &connector,
            conn,
            "plex.orders",
            query(),
            RowCountEstimate::unknown(),
            options(10),
        );
        let results = drain(&mut extractor).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(ids(&results), (0..30).collect::<Vec<_>>());
        // Three full chunks, then an empty one ends the loop.
        assert_eq!(source.data_queries().len(), 4);
    }

    #[tokio::test]
    async fn test_approximate_underestimate_keeps_reading() {
        let source = FakeSource::new();
        source.add_table(FakeTable::with_rows("orders", 35));
        let connector = source.connector();
        let conn = connector.connect("plex").await.unwrap();
        let mut extractor = ChunkedExtractor::new(
            &connector,
            conn,
            "plex.orders",
            query(),
            RowCountEstimate::approximate(12),
            options(10),
        );
        let results = drain(&mut extractor).await.unwrap();
        assert_eq!(ids(&results).len(), 35);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let source = FakeSource::new();
        source.add_table(FakeTable::with_rows("orders", 20));
        source.fail_chunk(10, vec![QueryFailure::LostConnection, QueryFailure::Timeout]);
        let connector = source.connector();
        let conn = connector.connect("plex").await.unwrap();
        let mut extractor = ChunkedExtractor::new(
            &connector,
            conn,
            "plex.orders",
            query(),
            RowCountEstimate::exact(20),
            options(10),
        );
        let results = drain(&mut extractor).await.unwrap();
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(ids(&results).len(), 20);
        // Initial connection plus one reconnect per failed attempt.
        assert_eq!(source.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_skip_chunk() {
        let source = FakeSource::new();
        source.add_table(FakeTable::with_rows("orders", 30));
        source.fail_chunk(
            10,
            vec![QueryFailure::Timeout, QueryFailure::Timeout, QueryFailure::Timeout],
        );
        let connector = source.connector();
        let conn = connector.connect("plex").await.unwrap();
        let mut extractor = ChunkedExtractor::new(
            &connector,
            conn,
            "plex.orders",
            query(),
            RowCountEstimate::exact(30),
            options(10),
        );
        let results = drain(&mut extractor).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(matches!(
            results[1],
            Err(ExtractionError::Skipped { index: 1, offset: 10, attempts: 3, .. })
        ));
        assert_eq!(ids(&results), (0..10).chain(20..30).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_permanent_failure_propagates() {
        let source = FakeSource::new();
        source.add_table(FakeTable::with_rows("orders", 30));
        source.fail_chunk(0, vec![QueryFailure::Permanent]);
        let connector = source.connector();
        let conn = connector.connect("plex").await.unwrap();
        let mut extractor = ChunkedExtractor::new(
            &connector,
            conn,
            "plex.orders",
            query(),
            RowCountEstimate::exact(30),
            options(10),
        );
        let err = extractor.next_chunk().await.unwrap_err();
        assert!(matches!(err, SyncError::PermanentSource { .. }));
        assert_eq!(source.data_queries().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_stops_after_consecutive_skips() {
        let source = FakeSource::new();
        source.add_table(FakeTable::with_rows("orders", 100));
        for offset in [0, 10, 20] {
            source.fail_chunk(offset, vec![QueryFailure::Timeout; 3]);
        }
        let connector = source.connector();
        let conn = connector.connect("plex").await.unwrap();
        let mut extractor = ChunkedExtractor::new(
            &connector,
            conn,
            "plex.orders",
            query(),
            RowCountEstimate::unknown(),
            options(10),
        );
        let results = drain(&mut extractor).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_err()));
    }

    #[tokio::test]
    async fn test_chunks_are_sanitized() {
        let source = FakeSource::new();
        let mut table = FakeTable::with_rows("orders", 2);
        table.rows[1][1] = SqlValue::Text("NULL".into());
        source.add_table(table);
        let connector = source.connector();
        let conn = connector.connect("plex").await.unwrap();
        let mut extractor = ChunkedExtractor::new(
            &connector,
            conn,
            "plex.orders",
            query(),
            RowCountEstimate::exact(2),
            options(10),
        );
        let chunk = extractor.next_chunk().await.unwrap().unwrap().unwrap();
        assert_eq!(chunk.rows[1][1], SqlValue::Null);
    }
}
