//! MySQL/MariaDB source connector.
//!
//! Uses SQLx for connection pooling and async query execution. Each source
//! system gets its own pool, bounded by the system's `max_connections`, so
//! parallel tables cannot overwhelm a single server.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySql, MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::pool::PoolConnection;
use sqlx::Row;
use tracing::{debug, warn};

use super::decode::{classify_error, rows_to_set};
use crate::config::SourceConfig;
use crate::core::{RowSet, SourceColumn, SourceConnection, SourceConnector};
use crate::error::{Result, SyncError};

/// Connection pool acquire timeout.
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for catalog (information_schema) lookups.
const CATALOG_TIMEOUT: Duration = Duration::from_secs(60);

struct SourcePool {
    pool: MySqlPool,
    database: String,
    connect_timeout: Duration,
}

/// Opens pooled connections to the configured MySQL source systems.
pub struct MySqlConnector {
    pools: HashMap<String, SourcePool>,
    statement_timeout: Duration,
}

impl MySqlConnector {
    /// Build one lazy pool per source. No connection is opened until a
    /// table asks for one.
    pub fn new(sources: &[SourceConfig], statement_timeout: Duration) -> Self {
        let pools = sources
            .iter()
            .map(|source| {
                let options = MySqlConnectOptions::new()
                    .host(&source.host)
                    .port(source.port)
                    .database(&source.database)
                    .username(&source.user)
                    .password(&source.resolved_password())
                    .ssl_mode(MySqlSslMode::Preferred);

                let pool = MySqlPoolOptions::new()
                    .max_connections(source.max_connections)
                    .acquire_timeout(POOL_ACQUIRE_TIMEOUT)
                    .connect_lazy_with(options);

                debug!(
                    "{}: pool for {}:{}/{} (max {} connections)",
                    source.id, source.host, source.port, source.database, source.max_connections
                );

                (
                    source.id.clone(),
                    SourcePool {
                        pool,
                        database: source.database.clone(),
                        connect_timeout: Duration::from_secs(source.connect_timeout_secs),
                    },
                )
            })
            .collect();

        Self {
            pools,
            statement_timeout,
        }
    }
}

#[async_trait]
impl SourceConnector for MySqlConnector {
    async fn connect(&self, system_id: &str) -> Result<Box<dyn SourceConnection>> {
        let source = self
            .pools
            .get(system_id)
            .ok_or_else(|| SyncError::Config(format!("unknown source system '{}'", system_id)))?;

        let acquired = tokio::time::timeout(source.connect_timeout, source.pool.acquire()).await;
        let conn = match acquired {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(classify_error(system_id, e, "acquiring connection")),
            Err(_) => {
                return Err(SyncError::transient(
                    system_id,
                    format!("connect timed out after {:?}", source.connect_timeout),
                ))
            }
        };

        let mut conn = MySqlSourceConnection {
            system_id: system_id.to_string(),
            database: source.database.clone(),
            conn,
        };
        conn.apply_statement_timeout(self.statement_timeout).await;
        Ok(Box::new(conn))
    }

    async fn close(&self) {
        for (system_id, source) in &self.pools {
            source.pool.close().await;
            debug!("{}: pool closed", system_id);
        }
    }
}

/// A pooled connection to one source system.
pub struct MySqlSourceConnection {
    system_id: String,
    database: String,
    conn: PoolConnection<MySql>,
}

impl MySqlSourceConnection {
    /// Bound server-side execution time for this session. MariaDB and older
    /// MySQL servers reject the variable; the client-side timeout still applies.
    async fn apply_statement_timeout(&mut self, timeout: Duration) {
        let sql = format!("SET SESSION MAX_EXECUTION_TIME = {}", timeout.as_millis());
        if let Err(e) = sqlx::query(&sql).execute(&mut *self.conn).await {
            warn!(
                "{}: session statement timeout not supported, continuing without it: {}",
                self.system_id, e
            );
        }
    }

    async fn fetch(&mut self, sql: &str, timeout: Duration, context: &str) -> Result<Vec<MySqlRow>> {
        debug!("{}: {}", self.system_id, sql);
        let system_id = self.system_id.clone();
        bounded(&system_id, timeout, async {
            sqlx::query(sql)
                .fetch_all(&mut *self.conn)
                .await
                .map_err(|e| classify_error(&system_id, e, context))
        })
        .await
    }

    async fn fetch_catalog(&mut self, sql: &str, table: Option<&str>, context: &str) -> Result<Vec<MySqlRow>> {
        let system_id = self.system_id.clone();
        let mut query = sqlx::query(sql).bind(self.database.clone());
        if let Some(table) = table {
            query = query.bind(table.to_string());
        }
        bounded(&system_id, CATALOG_TIMEOUT, async {
            query
                .fetch_all(&mut *self.conn)
                .await
                .map_err(|e| classify_error(&system_id, e, context))
        })
        .await
    }
}

async fn bounded<T, F>(system_id: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::transient(
            system_id,
            format!("query timed out after {:?}", timeout),
        )),
    }
}

fn opt_positive(value: i64) -> Option<i64> {
    (value > 0).then_some(value)
}

#[async_trait]
impl SourceConnection for MySqlSourceConnection {
    fn system_id(&self) -> &str {
        &self.system_id
    }

    async fn query(&mut self, sql: &str, timeout: Duration) -> Result<RowSet> {
        let rows = self.fetch(sql, timeout, "query").await?;
        Ok(rows_to_set(&rows))
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        // CAST to CHAR to handle collation differences
        let query = r#"
            SELECT CAST(TABLE_NAME AS CHAR(255)) AS TABLE_NAME
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
        "#;
        let rows = self.fetch_catalog(query, None, "listing tables").await?;
        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("TABLE_NAME")
                    .map_err(|e| classify_error(&self.system_id, e, "listing tables"))
            })
            .collect()
    }

    async fn describe_table(&mut self, table: &str) -> Result<Vec<SourceColumn>> {
        // COLUMN_TYPE keeps display width and signedness, e.g. "tinyint(1)" or "int unsigned".
        let query = r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME,
                CAST(COLUMN_TYPE AS CHAR(1024)) AS COLUMN_TYPE,
                CAST(COLUMN_DEFAULT AS CHAR(1024)) AS COLUMN_DEFAULT,
                CAST(CASE
                    WHEN CHARACTER_MAXIMUM_LENGTH IS NULL THEN 0
                    WHEN CHARACTER_MAXIMUM_LENGTH > 2147483647 THEN -1
                    ELSE CHARACTER_MAXIMUM_LENGTH
                END AS SIGNED) AS max_length,
                CAST(COALESCE(NUMERIC_PRECISION, 0) AS SIGNED) AS num_precision,
                CAST(COALESCE(NUMERIC_SCALE, 0) AS SIGNED) AS num_scale,
                IF(IS_NULLABLE = 'YES', 1, 0) AS is_nullable,
                CAST(ORDINAL_POSITION AS SIGNED) AS ORDINAL_POSITION
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
        "#;
        let rows = self
            .fetch_catalog(query, Some(table), "loading columns")
            .await?;

        let columns = rows
            .iter()
            .map(|row| -> std::result::Result<SourceColumn, sqlx::Error> {
                Ok(SourceColumn {
                    name: row.try_get("COLUMN_NAME")?,
                    native_type: row.try_get("COLUMN_TYPE")?,
                    is_nullable: row.try_get::<i64, _>("is_nullable")? == 1,
                    default: row.try_get("COLUMN_DEFAULT")?,
                    max_length: opt_positive(row.try_get("max_length")?),
                    precision: opt_positive(row.try_get("num_precision")?),
                    scale: opt_positive(row.try_get("num_scale")?),
                    ordinal_pos: row.try_get::<i64, _>("ORDINAL_POSITION")? as i32,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| classify_error(&self.system_id, e, "decoding columns"))?;

        debug!("{}: {} has {} columns", self.system_id, table, columns.len());
        Ok(columns)
    }

    async fn primary_key(&mut self, table: &str) -> Result<Vec<String>> {
        let query = r#"
            SELECT CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME
            FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY'
            ORDER BY ORDINAL_POSITION
        "#;
        let rows = self
            .fetch_catalog(query, Some(table), "loading primary key")
            .await?;
        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("COLUMN_NAME")
                    .map_err(|e| classify_error(&self.system_id, e, "loading primary key"))
            })
            .collect()
    }

    async fn catalog_row_count(&mut self, table: &str) -> Result<Option<u64>> {
        let query = r#"
            SELECT CAST(TABLE_ROWS AS SIGNED) AS table_rows
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
        "#;
        let rows = self
            .fetch_catalog(query, Some(table), "reading table statistics")
            .await?;
        let count = rows
            .first()
            .and_then(|row| row.try_get::<Option<i64>, _>("table_rows").ok().flatten())
            .and_then(|n| u64::try_from(n).ok());
        Ok(count)
    }

    async fn close(self: Box<Self>) {
        // Dropping the pooled connection returns it to the pool.
        debug!("{}: connection released", self.system_id);
    }
}
