//! Configuration validation.

use super::{Config, SyncMode};
use crate::error::{Result, SyncError};
use crate::strategy::MAX_LOOKBACK_DAYS;
use std::collections::HashSet;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.sources.is_empty() {
        return Err(SyncError::Config("at least one source is required".into()));
    }

    let mut seen = HashSet::new();
    for source in &config.sources {
        if source.id.is_empty() {
            return Err(SyncError::Config("sources[].id is required".into()));
        }
        if !seen.insert(source.id.as_str()) {
            return Err(SyncError::Config(format!(
                "duplicate source id '{}'",
                source.id
            )));
        }
        if source.host.is_empty() {
            return Err(SyncError::Config(format!(
                "source '{}': host is required",
                source.id
            )));
        }
        if source.database.is_empty() {
            return Err(SyncError::Config(format!(
                "source '{}': database is required",
                source.id
            )));
        }
        if source.user.is_empty() {
            return Err(SyncError::Config(format!(
                "source '{}': user is required",
                source.id
            )));
        }
        if source.max_connections == 0 {
            return Err(SyncError::Config(format!(
                "source '{}': max_connections must be at least 1",
                source.id
            )));
        }
    }

    if config.destination.project_id.is_empty() {
        return Err(SyncError::Config("destination.project_id is required".into()));
    }
    if config.destination.dataset.is_empty() {
        return Err(SyncError::Config("destination.dataset is required".into()));
    }
    if config.destination.write_batch_rows == 0 {
        return Err(SyncError::Config(
            "destination.write_batch_rows must be at least 1".into(),
        ));
    }

    if let Some(0) = config.sync.workers {
        return Err(SyncError::Config("sync.workers must be at least 1".into()));
    }
    if config.sync.chunk_size == 0 {
        return Err(SyncError::Config("sync.chunk_size must be at least 1".into()));
    }
    if config.sync.lookback_days > MAX_LOOKBACK_DAYS {
        return Err(SyncError::Config(format!(
            "sync.lookback_days must be at most {}",
            MAX_LOOKBACK_DAYS
        )));
    }
    if config.sync.max_retries == 0 {
        return Err(SyncError::Config("sync.max_retries must be at least 1".into()));
    }

    for (system, tables) in &config.strategies {
        if !seen.contains(system.as_str()) {
            return Err(SyncError::Config(format!(
                "strategies reference unknown source '{}'",
                system
            )));
        }
        for (table, strategy) in tables {
            if let Some(0) = strategy.chunk_size {
                return Err(SyncError::Config(format!(
                    "strategies.{}.{}: chunk_size must be at least 1",
                    system, table
                )));
            }
            if strategy.lookback_days.is_some_and(|d| d > MAX_LOOKBACK_DAYS) {
                return Err(SyncError::Config(format!(
                    "strategies.{}.{}: lookback_days must be at most {}",
                    system, table, MAX_LOOKBACK_DAYS
                )));
            }
            if strategy.strategy == SyncMode::Incremental
                && strategy.watermark_columns.iter().any(|c| c.trim().is_empty())
            {
                return Err(SyncError::Config(format!(
                    "strategies.{}.{}: watermark column names cannot be empty",
                    system, table
                )));
            }
        }
    }

    Ok(())
}
