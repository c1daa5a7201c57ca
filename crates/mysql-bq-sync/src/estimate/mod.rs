//! Three-tier row count estimation.
//!
//! 1. `COUNT(*)` over the query with a short timeout (exact).
//! 2. Catalog statistics for the base table, inflated by 20% (approximate).
//! 3. Unknown: extraction reads until an empty chunk.
//!
//! Only a dead connection is an error; every other failure falls through to
//! the next tier.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::{SourceConnection, SqlValue};
use crate::error::{Result, SyncError};
use crate::strategy::SourceQuery;

/// Safety margin applied to catalog statistics, in percent.
pub const CATALOG_MARGIN_PERCENT: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Exact,
    Approximate,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCountEstimate {
    pub value: u64,
    pub confidence: Confidence,
}

impl RowCountEstimate {
    pub fn exact(value: u64) -> Self {
        Self {
            value,
            confidence: Confidence::Exact,
        }
    }

    pub fn approximate(value: u64) -> Self {
        Self {
            value,
            confidence: Confidence::Approximate,
        }
    }

    pub fn unknown() -> Self {
        Self {
            value: 0,
            confidence: Confidence::Unknown,
        }
    }

    /// Number of chunks the estimate implies, `None` when unknown.
    pub fn planned_chunks(&self, chunk_size: usize) -> Option<u64> {
        match self.confidence {
            Confidence::Unknown => None,
            _ => Some(self.value.div_ceil(chunk_size.max(1) as u64)),
        }
    }
}

/// Estimate the rows `query` will return.
///
/// `base_table` is consulted for catalog statistics; custom queries pass the
/// table they were configured for.
pub async fn estimate(
    conn: &mut dyn SourceConnection,
    query: &SourceQuery,
    base_table: &str,
    count_timeout: Duration,
) -> Result<RowCountEstimate> {
    match conn.query(&query.count_sql(), count_timeout).await {
        Ok(rows) => match rows.scalar().and_then(as_count) {
            Some(count) => return Ok(RowCountEstimate::exact(count)),
            None => warn!("{}: COUNT(*) returned no usable value", base_table),
        },
        Err(e) if is_connection_dead(&e) => return Err(e),
        Err(e) => warn!("{}: COUNT(*) failed, using catalog statistics: {}", base_table, e),
    }

    match conn.catalog_row_count(base_table).await {
        Ok(Some(rows)) => {
            let inflated = rows.saturating_add((rows * CATALOG_MARGIN_PERCENT).div_ceil(100));
            debug!(
                "{}: catalog reports {} rows, estimating {}",
                base_table, rows, inflated
            );
            Ok(RowCountEstimate::approximate(inflated))
        }
        Ok(None) => {
            warn!("{}: no catalog statistics, row count unknown", base_table);
            Ok(RowCountEstimate::unknown())
        }
        Err(e) if is_connection_dead(&e) => Err(e),
        Err(e) => {
            warn!("{}: catalog statistics unavailable: {}", base_table, e);
            Ok(RowCountEstimate::unknown())
        }
    }
}

// A timed-out count is expected; a lost connection or exhausted pool is not.
fn is_connection_dead(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::ConnectionLost { .. } | SyncError::PoolExhausted { .. }
    )
}

fn as_count(value: &SqlValue) -> Option<u64> {
    match value {
        SqlValue::Int(n) => u64::try_from(*n).ok(),
        SqlValue::Decimal(d) => d.to_string().parse().ok(),
        SqlValue::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}
