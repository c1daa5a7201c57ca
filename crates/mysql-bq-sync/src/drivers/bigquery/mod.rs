//! BigQuery destination driver.
//!
//! Everything runs as query jobs: DDL, catalog lookups, window deletes, and
//! chunk writes through per-chunk staging tables.

mod render;

use std::time::Duration;

use async_trait::async_trait;
use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::model::query_response::ResultSet;
use gcp_bigquery_client::Client;
use tracing::{debug, info, warn};

use crate::config::DestinationConfig;
use crate::core::identifier::{qualify_bigquery, quote_literal};
use crate::core::{Chunk, DestinationField, FieldMode, LogicalType, Warehouse, WriteMode};
use crate::error::{Result, SyncError};

use render::{
    add_column_ddl, chunk_statements, drop_not_null_ddl, staging_table_name, ChunkStatements,
};

/// Destination warehouse backed by one BigQuery dataset.
pub struct BigQueryWarehouse {
    client: Client,
    project_id: String,
    dataset: String,
    location: String,
    write_batch_rows: usize,
    job_timeout: Duration,
}

impl BigQueryWarehouse {
    /// Authenticate with the configured service account key, or with
    /// application default credentials when no key file is set.
    pub async fn new(config: &DestinationConfig, job_timeout: Duration) -> Result<Self> {
        // Reject unusable project/dataset names before any request is made.
        qualify_bigquery(&config.project_id, &config.dataset, "INFORMATION_SCHEMA")?;

        let client = match &config.credentials_path {
            Some(path) => {
                let key = gcp_bigquery_client::yup_oauth2::read_service_account_key(path)
                    .await
                    .map_err(|e| {
                        SyncError::Config(format!(
                            "Failed to read credentials from '{}': {}",
                            path.display(),
                            e
                        ))
                    })?;
                Client::from_service_account_key(key, false)
                    .await
                    .map_err(|e| bq_error("creating client from service account key", e))?
            }
            None => Client::from_application_default_credentials()
                .await
                .map_err(|e| bq_error("creating client with application default credentials", e))?,
        };

        info!(
            "BigQuery destination {}.{} (location {})",
            config.project_id, config.dataset, config.location
        );

        Ok(Self {
            client,
            project_id: config.project_id.clone(),
            dataset: config.dataset.clone(),
            location: config.location.clone(),
            write_batch_rows: config.write_batch_rows.max(1),
            job_timeout,
        })
    }

    async fn query(&self, sql: &str) -> Result<ResultSet> {
        debug!("BigQuery: {}", sql);
        let mut request = QueryRequest::new(sql);
        request.location = Some(self.location.clone());
        request.timeout_ms = Some(i32::try_from(self.job_timeout.as_millis()).unwrap_or(i32::MAX));

        let response = self
            .client
            .job()
            .query(&self.project_id, request)
            .await
            .map_err(|e| bq_error("query", e))?;

        if let Some(errors) = response.errors.as_ref().filter(|e| !e.is_empty()) {
            return Err(SyncError::Destination(format!("query failed: {:?}", errors)));
        }
        if response.job_complete != Some(true) {
            return Err(SyncError::Destination(format!(
                "query job did not complete within {:?}",
                self.job_timeout
            )));
        }
        Ok(ResultSet::new_from_query_response(response))
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        match self
            .client
            .table()
            .get(&self.project_id, &self.dataset, table, None)
            .await
        {
            Ok(_) => Ok(true),
            Err(BQError::ResponseError { error }) if error.error.code == 404 => Ok(false),
            Err(e) => Err(bq_error("table lookup", e)),
        }
    }

    /// Stage, then publish. Destination rows only change in the publish
    /// statement.
    async fn run_chunk(&self, statements: &ChunkStatements) -> Result<()> {
        for sql in &statements.prepare {
            self.query(sql).await?;
        }
        for sql in &statements.inserts {
            self.query(sql).await?;
        }
        self.query(&statements.publish).await.map(|_| ())
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn ping(&self) -> Result<()> {
        self.query("SELECT 1").await.map(|_| ())
    }

    async fn create_dataset_if_absent(&self) -> Result<()> {
        let sql = format!(
            "CREATE SCHEMA IF NOT EXISTS `{}.{}` OPTIONS(location={})",
            self.project_id,
            self.dataset,
            quote_literal(&self.location)
        );
        self.query(&sql).await?;
        info!("Dataset {}.{} ready", self.project_id, self.dataset);
        Ok(())
    }

    async fn get_table_schema(&self, table: &str) -> Result<Option<Vec<DestinationField>>> {
        let sql = format!(
            "SELECT column_name, data_type, is_nullable \
             FROM `{}.{}.INFORMATION_SCHEMA.COLUMNS` \
             WHERE table_name = {} \
             ORDER BY ordinal_position",
            self.project_id,
            self.dataset,
            quote_literal(table)
        );
        let mut rs = self.query(&sql).await?;

        let mut fields = Vec::new();
        while rs.next_row() {
            let name = rs
                .get_string_by_name("column_name")
                .map_err(|e| bq_error("reading column_name", e))?
                .unwrap_or_default();
            let data_type = rs
                .get_string_by_name("data_type")
                .map_err(|e| bq_error("reading data_type", e))?
                .unwrap_or_default();
            let nullable = rs
                .get_string_by_name("is_nullable")
                .map_err(|e| bq_error("reading is_nullable", e))?
                .map_or(true, |v| v.eq_ignore_ascii_case("YES"));

            let mode = if nullable {
                FieldMode::Nullable
            } else {
                FieldMode::Required
            };
            fields.push(DestinationField::new(
                name,
                LogicalType::from_destination_name(&data_type),
                mode,
            ));
        }

        Ok((!fields.is_empty()).then_some(fields))
    }

    async fn add_fields(&self, table: &str, fields: &[DestinationField]) -> Result<()> {
        let qualified = self.qualified_table(table)?;
        for field in fields {
            self.query(&add_column_ddl(&qualified, field)?).await?;
            info!("{}: added column {} {}", table, field.name, field.logical_type);
        }
        Ok(())
    }

    async fn relax_fields(&self, table: &str, fields: &[DestinationField]) -> Result<()> {
        let qualified = self.qualified_table(table)?;
        for field in fields {
            self.query(&drop_not_null_ddl(&qualified, field)?).await?;
            info!("{}: column {} is now NULLABLE", table, field.name);
        }
        Ok(())
    }

    async fn write(
        &self,
        table: &str,
        chunk: &Chunk,
        schema: &[DestinationField],
        mode: WriteMode,
    ) -> Result<()> {
        let qualified = self.qualified_table(table)?;
        let staging = self.qualified_table(&staging_table_name(table, chunk.index))?;
        let statements = chunk_statements(
            &qualified,
            &staging,
            chunk,
            schema,
            mode,
            self.write_batch_rows,
        )?;

        let result = self.run_chunk(&statements).await;
        if let Err(e) = self.query(&statements.cleanup).await {
            warn!("{}: could not drop staging table {}: {}", table, staging, e);
        }
        result.map_err(|e| SyncError::write(table, e.to_string()))?;

        debug!(
            "{}: chunk {} wrote {} rows ({}, {} insert statements)",
            table,
            chunk.index,
            chunk.len(),
            mode,
            statements.inserts.len()
        );
        Ok(())
    }

    async fn execute_statement(&self, sql: &str) -> Result<()> {
        self.query(sql).await.map(|_| ())
    }

    fn qualified_table(&self, table: &str) -> Result<String> {
        qualify_bigquery(&self.project_id, &self.dataset, table)
    }

    async fn row_count(&self, table: &str) -> Result<Option<u64>> {
        if !self.table_exists(table).await? {
            return Ok(None);
        }
        let sql = format!("SELECT COUNT(*) FROM {}", self.qualified_table(table)?);
        let mut rs = self.query(&sql).await?;
        let count = if rs.next_row() {
            rs.get_i64(0).map_err(|e| bq_error("reading row count", e))?
        } else {
            None
        };
        Ok(Some(count.and_then(|n| u64::try_from(n).ok()).unwrap_or(0)))
    }
}

/// Whether a BigQuery failure would likely succeed if attempted again.
fn is_retryable(err: &BQError) -> bool {
    match err {
        BQError::RequestError(_) | BQError::NoToken => true,
        BQError::ResponseError { error } => {
            matches!(error.error.code, 408 | 429 | 500 | 502 | 503 | 504)
        }
        _ => false,
    }
}

fn describe(err: &BQError) -> String {
    let class = if is_retryable(err) {
        "retryable"
    } else {
        "non-retryable"
    };
    format!("{} ({})", err, class)
}

fn bq_error(context: &str, err: BQError) -> SyncError {
    SyncError::Destination(format!("{}: {}", context, describe(&err)))
}
