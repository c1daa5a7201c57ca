//! Per-table strategy resolution.
//!
//! Turns a table's strategy record into the concrete plan the loader runs:
//! the source query, the destination delete predicate for incremental
//! windows, and the write mode.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::config::{SyncConfig, SyncMode, TableStrategyConfig};
use crate::core::identifier::{quote_bigquery, quote_literal, quote_mysql};
use crate::core::TableSpec;
use crate::error::{Result, SyncError};

/// Longest accepted lookback window, in days.
pub const MAX_LOOKBACK_DAYS: u32 = 36_500;

/// Effective strategy for one table in this run.
#[derive(Debug, Clone, PartialEq)]
pub struct TableStrategy {
    pub mode: SyncMode,
    pub watermark_columns: Vec<String>,
    pub custom_query: Option<String>,
    pub delete_condition: Option<String>,
    pub chunk_size: usize,
    pub lookback_days: u32,
}

impl TableStrategy {
    /// Combine a table's record (if any) with run-level settings.
    pub fn from_config(record: Option<&TableStrategyConfig>, sync: &SyncConfig) -> Self {
        let record = record.cloned().unwrap_or_default();
        Self {
            mode: if sync.force_full_refresh {
                SyncMode::FullRefresh
            } else {
                record.strategy
            },
            watermark_columns: record.watermark_columns,
            custom_query: record.custom_query,
            delete_condition: record.delete_condition,
            chunk_size: record.chunk_size.unwrap_or(sync.chunk_size),
            lookback_days: record.lookback_days.unwrap_or(sync.lookback_days),
        }
    }

    pub fn full_refresh(chunk_size: usize) -> Self {
        Self {
            mode: SyncMode::FullRefresh,
            watermark_columns: Vec::new(),
            custom_query: None,
            delete_condition: None,
            chunk_size,
            lookback_days: 0,
        }
    }

    pub fn incremental(columns: &[&str], lookback_days: u32, chunk_size: usize) -> Self {
        Self {
            mode: SyncMode::Incremental,
            watermark_columns: columns.iter().map(|c| c.to_string()).collect(),
            custom_query: None,
            delete_condition: None,
            chunk_size,
            lookback_days,
        }
    }
}

/// How the destination table is written over a whole load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// First written chunk replaces the table, later chunks append.
    Replace,
    /// Every chunk appends after the stale window was deleted.
    Incremental,
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadMode::Replace => write!(f, "REPLACE"),
            LoadMode::Incremental => write!(f, "INCREMENTAL"),
        }
    }
}

/// A source query that can be counted and paginated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceQuery {
    sql: String,
    custom: bool,
    order_by: Vec<String>,
}

impl SourceQuery {
    /// A generated query; stable ordering may be added later.
    pub fn generated(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            custom: false,
            order_by: Vec::new(),
        }
    }

    /// A user-supplied query, paginated verbatim.
    pub fn custom(sql: &str) -> Self {
        Self {
            sql: sql.trim().trim_end_matches(';').trim_end().to_string(),
            custom: true,
            order_by: Vec::new(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn is_custom(&self) -> bool {
        self.custom
    }

    pub fn is_ordered(&self) -> bool {
        !self.order_by.is_empty()
    }

    /// Order pagination by the given key columns. Ignored for custom queries.
    pub fn with_ordering(mut self, key_columns: &[String]) -> Result<Self> {
        if self.custom {
            return Ok(self);
        }
        self.order_by = key_columns
            .iter()
            .map(|c| quote_mysql(c))
            .collect::<Result<_>>()?;
        Ok(self)
    }

    /// `COUNT(*)` over the query.
    pub fn count_sql(&self) -> String {
        format!("SELECT COUNT(*) FROM ({}) AS subquery", self.sql)
    }

    /// One page of the query.
    pub fn paginated(&self, limit: usize, offset: u64) -> String {
        if self.order_by.is_empty() {
            format!("{} LIMIT {} OFFSET {}", self.sql, limit, offset)
        } else {
            format!(
                "{} ORDER BY {} LIMIT {} OFFSET {}",
                self.sql,
                self.order_by.join(", "),
                limit,
                offset
            )
        }
    }
}

impl fmt::Display for SourceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// Start of the incremental window, shared by the source and destination predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookbackWindow {
    pub days: u32,
    pub start: NaiveDate,
}

impl LookbackWindow {
    pub fn ending(today: NaiveDate, days: u32) -> Result<Self> {
        let start = today
            .checked_sub_signed(Duration::days(i64::from(days)))
            .ok_or_else(|| {
                SyncError::Config(format!(
                    "lookback of {} days from {} is out of the supported date range",
                    days, today
                ))
            })?;
        Ok(Self { days, start })
    }

    fn start_literal(&self) -> String {
        quote_literal(&self.start.format("%Y-%m-%d").to_string())
    }

    /// Substitute `{lookback_days}` and `{window_start}` in a template.
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{lookback_days}", &self.days.to_string())
            .replace("{window_start}", &self.start.format("%Y-%m-%d").to_string())
    }
}

/// The plan for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStrategy {
    /// Mode actually used, after any degradation.
    pub mode: SyncMode,
    pub source_query: SourceQuery,
    /// Destination predicate (without `WHERE`) deleting the stale window.
    pub delete_predicate: Option<String>,
    pub load_mode: LoadMode,
    /// Incremental was requested but could not be honored.
    pub degraded: bool,
    pub chunk_size: usize,
}

/// Resolve the plan for a table.
pub fn resolve(
    spec: &TableSpec,
    strategy: &TableStrategy,
    today: NaiveDate,
) -> Result<ResolvedStrategy> {
    let table = quote_mysql(&spec.source_table)?;
    let full_scan = || SourceQuery::generated(format!("SELECT * FROM {}", table));

    if strategy.mode == SyncMode::FullRefresh {
        return Ok(ResolvedStrategy {
            mode: SyncMode::FullRefresh,
            source_query: full_scan(),
            delete_predicate: None,
            load_mode: LoadMode::Replace,
            degraded: false,
            chunk_size: strategy.chunk_size,
        });
    }

    let window = LookbackWindow::ending(today, strategy.lookback_days)?;

    if strategy.watermark_columns.is_empty() && strategy.custom_query.is_none() {
        warn!(
            "{}: incremental strategy has no watermark columns, falling back to full refresh",
            spec
        );
        return Ok(ResolvedStrategy {
            mode: SyncMode::FullRefresh,
            source_query: full_scan(),
            delete_predicate: None,
            load_mode: LoadMode::Replace,
            degraded: true,
            chunk_size: strategy.chunk_size,
        });
    }

    let source_query = match &strategy.custom_query {
        Some(template) => SourceQuery::custom(&window.render(template)),
        None => {
            let conditions = strategy
                .watermark_columns
                .iter()
                .map(|c| Ok(format!("{} >= {}", quote_mysql(c)?, window.start_literal())))
                .collect::<Result<Vec<_>>>()?;
            SourceQuery::generated(format!(
                "SELECT * FROM {} WHERE ({})",
                table,
                conditions.join(" OR ")
            ))
        }
    };

    let delete_predicate = match &strategy.delete_condition {
        Some(template) => Some(strip_where(&window.render(template))),
        None if !strategy.watermark_columns.is_empty() => {
            let conditions = strategy
                .watermark_columns
                .iter()
                .map(|c| {
                    Ok(format!(
                        "DATE({}) >= DATE {}",
                        quote_bigquery(c)?,
                        window.start_literal()
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            Some(conditions.join(" OR "))
        }
        None => None,
    };

    Ok(ResolvedStrategy {
        mode: SyncMode::Incremental,
        source_query,
        delete_predicate,
        load_mode: LoadMode::Incremental,
        degraded: false,
        chunk_size: strategy.chunk_size,
    })
}

fn strip_where(predicate: &str) -> String {
    let trimmed = predicate.trim();
    match trimmed.get(..5).zip(trimmed.get(5..)) {
        Some((head, rest))
            if head.eq_ignore_ascii_case("where") && rest.starts_with(char::is_whitespace) =>
        {
            rest.trim().to_string()
        }
        _ => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TableSpec {
        TableSpec::new("plex", "orders", "plex_")
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
    }

    #[test]
    fn test_full_refresh() {
        let plan = resolve(&spec(), &TableStrategy::full_refresh(100_000), today()).unwrap();
        assert_eq!(plan.mode, SyncMode::FullRefresh);
        assert_eq!(plan.source_query.sql(), "SELECT * FROM `orders`");
        assert_eq!(plan.delete_predicate, None);
        assert_eq!(plan.load_mode, LoadMode::Replace);
        assert!(!plan.degraded);
    }

    #[test]
    fn test_incremental_or_combines_watermarks() {
        let strategy = TableStrategy::incremental(&["updated_at", "created_at"], 3, 50_000);
        let plan = resolve(&spec(), &strategy, today()).unwrap();
        assert_eq!(plan.mode, SyncMode::Incremental);
        assert_eq!(plan.load_mode, LoadMode::Incremental);
        assert_eq!(
            plan.source_query.sql(),
            "SELECT * FROM `orders` WHERE (`updated_at` >= '2024-03-07' OR `created_at` >= '2024-03-07')"
        );
        assert_eq!(
            plan.delete_predicate.as_deref(),
            Some("DATE(`updated_at`) >= DATE '2024-03-07' OR DATE(`created_at`) >= DATE '2024-03-07'")
        );
        assert_eq!(plan.chunk_size, 50_000);
    }

    #[test]
    fn test_incremental_without_watermarks_degrades() {
        let strategy = TableStrategy::incremental(&[], 3, 100_000);
        let plan = resolve(&spec(), &strategy, today()).unwrap();
        assert_eq!(plan.mode, SyncMode::FullRefresh);
        assert_eq!(plan.load_mode, LoadMode::Replace);
        assert!(plan.degraded);
        assert_eq!(plan.delete_predicate, None);
    }

    #[test]
    fn test_custom_templates_used_verbatim() {
        let mut strategy = TableStrategy::incremental(&["fecha"], 7, 100_000);
        strategy.custom_query = Some(
            "SELECT id, total FROM orders WHERE fecha >= DATE_SUB(CURDATE(), INTERVAL {lookback_days} DAY);"
                .to_string(),
        );
        strategy.delete_condition =
            Some("WHERE fecha >= DATE_SUB(CURRENT_DATE(), INTERVAL {lookback_days} DAY)".to_string());
        let plan = resolve(&spec(), &strategy, today()).unwrap();
        assert!(plan.source_query.is_custom());
        assert_eq!(
            plan.source_query.sql(),
            "SELECT id, total FROM orders WHERE fecha >= DATE_SUB(CURDATE(), INTERVAL 7 DAY)"
        );
        assert_eq!(
            plan.delete_predicate.as_deref(),
            Some("fecha >= DATE_SUB(CURRENT_DATE(), INTERVAL 7 DAY)")
        );
    }

    #[test]
    fn test_custom_query_falls_back_to_generated_delete() {
        let mut strategy = TableStrategy::incremental(&["fecha"], 1, 100_000);
        strategy.custom_query = Some("SELECT * FROM orders WHERE fecha >= '{window_start}'".into());
        let plan = resolve(&spec(), &strategy, today()).unwrap();
        assert_eq!(plan.source_query.sql(), "SELECT * FROM orders WHERE fecha >= '2024-03-09'");
        assert_eq!(
            plan.delete_predicate.as_deref(),
            Some("DATE(`fecha`) >= DATE '2024-03-09'")
        );
    }

    #[test]
    fn test_custom_query_without_watermark_has_no_delete() {
        let mut strategy = TableStrategy::incremental(&[], 1, 100_000);
        strategy.custom_query = Some("SELECT * FROM orders".into());
        let plan = resolve(&spec(), &strategy, today()).unwrap();
        assert_eq!(plan.mode, SyncMode::Incremental);
        assert!(!plan.degraded);
        assert_eq!(plan.delete_predicate, None);
    }

    #[test]
    fn test_force_full_refresh_overrides_record() {
        let record = TableStrategyConfig {
            strategy: SyncMode::Incremental,
            watermark_columns: vec!["updated_at".into()],
            chunk_size: Some(10),
            ..Default::default()
        };
        let sync = SyncConfig {
            force_full_refresh: true,
            ..Default::default()
        };
        let strategy = TableStrategy::from_config(Some(&record), &sync);
        assert_eq!(strategy.mode, SyncMode::FullRefresh);
        assert_eq!(strategy.chunk_size, 10);
        assert_eq!(strategy.lookback_days, 3);
    }

    #[test]
    fn test_missing_record_defaults_to_full_refresh() {
        let strategy = TableStrategy::from_config(None, &SyncConfig::default());
        assert_eq!(strategy.mode, SyncMode::FullRefresh);
        assert_eq!(strategy.chunk_size, 100_000);
    }

    #[test]
    fn test_pagination_and_ordering() {
        let query = SourceQuery::generated("SELECT * FROM `orders`")
            .with_ordering(&["id".to_string(), "line".to_string()])
            .unwrap();
        assert_eq!(
            query.paginated(100, 200),
            "SELECT * FROM `orders` ORDER BY `id`, `line` LIMIT 100 OFFSET 200"
        );
        assert_eq!(
            query.count_sql(),
            "SELECT COUNT(*) FROM (SELECT * FROM `orders`) AS subquery"
        );

        let custom = SourceQuery::custom("SELECT a FROM b ORDER BY a")
            .with_ordering(&["id".to_string()])
            .unwrap();
        assert!(!custom.is_ordered());
        assert_eq!(custom.paginated(10, 0), "SELECT a FROM b ORDER BY a LIMIT 10 OFFSET 0");
    }

    #[test]
    fn test_strip_where() {
        assert_eq!(strip_where("  WHERE a = 1"), "a = 1");
        assert_eq!(strip_where("where a = 1"), "a = 1");
        assert_eq!(strip_where("a = 1"), "a = 1");
        assert_eq!(strip_where("whereabouts = 1"), "whereabouts = 1");
        assert_eq!(strip_where("WHERE\n  a = 1"), "a = 1");
        assert_eq!(strip_where("where\ta = 1"), "a = 1");
        assert_eq!(strip_where("WHERE"), "WHERE");
    }

    #[test]
    fn test_lookback_window_bounds() {
        let window = LookbackWindow::ending(today(), 3).unwrap();
        assert_eq!(window.start, NaiveDate::from_ymd_opt(2024, 3, 7).unwrap());
        assert_eq!(window.render("{lookback_days}:{window_start}"), "3:2024-03-07");

        let strategy = TableStrategy {
            lookback_days: u32::MAX,
            ..TableStrategy::incremental(&["updated_at"], 3, 100_000)
        };
        let err = resolve(&spec(), &strategy, today()).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
