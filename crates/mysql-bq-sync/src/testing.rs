//! In-memory source and warehouse doubles for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::core::{
    Chunk, DestinationField, FieldMode, RowSet, SourceColumn, SourceConnection, SourceConnector,
    SqlValue, Warehouse, WriteMode,
};
use crate::error::{Result, SyncError};

/// Failure injected into a fake source query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFailure {
    Timeout,
    LostConnection,
    /// Transient, with "closed" in the message but the connection intact.
    ServerClosedCursor,
    Permanent,
    PoolExhausted,
}

impl QueryFailure {
    fn into_error(self, system: &str) -> SyncError {
        match self {
            QueryFailure::Timeout => SyncError::transient(system, "query timed out after 5s"),
            QueryFailure::LostConnection => {
                SyncError::connection_lost(system, "Lost connection to MySQL server during query")
            }
            QueryFailure::ServerClosedCursor => {
                SyncError::transient(system, "Lock wait timeout exceeded; cursor closed")
            }
            QueryFailure::Permanent => SyncError::permanent(
                system,
                "You have an error in your SQL syntax near 'FROM'",
            ),
            QueryFailure::PoolExhausted => SyncError::PoolExhausted {
                system: system.to_string(),
                message: "pool timed out while waiting for an open connection".to_string(),
            },
        }
    }
}

/// A source table held in memory.
#[derive(Debug, Clone)]
pub struct FakeTable {
    pub name: String,
    pub columns: Vec<SourceColumn>,
    pub rows: Vec<Vec<SqlValue>>,
    pub primary_key: Vec<String>,
    pub catalog_rows: Option<u64>,
    /// Applied to rows when the query carries a WHERE clause.
    pub window: Option<fn(&[SqlValue]) -> bool>,
}

impl FakeTable {
    /// `id INT NOT NULL` primary key and a nullable `name VARCHAR(64)`.
    pub fn with_rows(name: &str, count: usize) -> Self {
        Self {
            name: name.to_string(),
            columns: vec![column("id", "int(11)", false, 1), column("name", "varchar(64)", true, 2)],
            rows: (0..count)
                .map(|i| vec![SqlValue::Int(i as i64), SqlValue::Text(format!("row {}", i))])
                .collect(),
            primary_key: vec!["id".to_string()],
            catalog_rows: None,
            window: None,
        }
    }

    /// `id`, `updated_at DATE`, `created_at DATE` rows.
    pub fn dated(name: &str, rows: &[(i64, NaiveDate, NaiveDate)]) -> Self {
        Self {
            name: name.to_string(),
            columns: vec![
                column("id", "int(11)", false, 1),
                column("updated_at", "date", true, 2),
                column("created_at", "date", false, 3),
            ],
            rows: rows
                .iter()
                .map(|(id, u, c)| vec![SqlValue::Int(*id), SqlValue::Date(*u), SqlValue::Date(*c)])
                .collect(),
            primary_key: vec!["id".to_string()],
            catalog_rows: None,
            window: None,
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

pub fn column(name: &str, native_type: &str, nullable: bool, pos: i32) -> SourceColumn {
    SourceColumn {
        name: name.to_string(),
        native_type: native_type.to_string(),
        is_nullable: nullable,
        default: None,
        max_length: None,
        precision: None,
        scale: None,
        ordinal_pos: pos,
    }
}

#[derive(Default)]
struct SourceState {
    tables: BTreeMap<String, FakeTable>,
    count_failures: VecDeque<QueryFailure>,
    chunk_failures: HashMap<u64, VecDeque<QueryFailure>>,
    connect_failure: Option<QueryFailure>,
    describe_failure: Option<QueryFailure>,
    queries: Vec<String>,
    connects: usize,
    open: usize,
    max_open: usize,
    connection_limit: Option<usize>,
    query_delay: Option<Duration>,
}

/// Shared state behind fake connectors and connections.
#[derive(Default)]
pub struct FakeSource {
    state: Mutex<SourceState>,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_table(&self, table: FakeTable) {
        let mut state = self.state.lock().unwrap();
        state.tables.insert(table.name.clone(), table);
    }

    pub fn set_rows(&self, table: &str, rows: Vec<Vec<SqlValue>>) {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = state.tables.get_mut(table) {
            t.rows = rows;
        }
    }

    pub fn fail_count(&self, failure: QueryFailure) {
        self.state.lock().unwrap().count_failures.push_back(failure);
    }

    pub fn fail_chunk(&self, offset: u64, failures: Vec<QueryFailure>) {
        self.state
            .lock()
            .unwrap()
            .chunk_failures
            .entry(offset)
            .or_default()
            .extend(failures);
    }

    pub fn fail_connect(&self, failure: QueryFailure) {
        self.state.lock().unwrap().connect_failure = Some(failure);
    }

    pub fn fail_describe(&self, failure: QueryFailure) {
        self.state.lock().unwrap().describe_failure = Some(failure);
    }

    /// Refuse connections beyond `limit` open at once, like a drained pool.
    pub fn limit_connections(&self, limit: usize) {
        self.state.lock().unwrap().connection_limit = Some(limit);
    }

    /// Hold every query for `delay` so concurrent loads overlap.
    pub fn delay_queries(&self, delay: Duration) {
        self.state.lock().unwrap().query_delay = Some(delay);
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }

    /// Paginated data queries, excluding counts.
    pub fn data_queries(&self) -> Vec<String> {
        self.queries()
            .into_iter()
            .filter(|q| !q.starts_with("SELECT COUNT(*)") && q != "SELECT 1")
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    /// Most connections open at the same time.
    pub fn max_open(&self) -> usize {
        self.state.lock().unwrap().max_open
    }

    pub fn connector(self: &Arc<Self>) -> FakeConnector {
        FakeConnector {
            source: Arc::clone(self),
        }
    }
}

pub struct FakeConnector {
    source: Arc<FakeSource>,
}

#[async_trait]
impl SourceConnector for FakeConnector {
    async fn connect(&self, system_id: &str) -> Result<Box<dyn SourceConnection>> {
        let mut state = self.source.state.lock().unwrap();
        if let Some(failure) = state.connect_failure {
            return Err(failure.into_error(system_id));
        }
        if state.connection_limit.is_some_and(|limit| state.open >= limit) {
            return Err(QueryFailure::PoolExhausted.into_error(system_id));
        }
        state.connects += 1;
        state.open += 1;
        state.max_open = state.max_open.max(state.open);
        Ok(Box::new(FakeConnection {
            system_id: system_id.to_string(),
            source: Arc::clone(&self.source),
        }))
    }
}

pub struct FakeConnection {
    system_id: String,
    source: Arc<FakeSource>,
}

impl FakeConnection {
    fn table_for<'s>(state: &'s SourceState, sql: &str) -> Option<&'s FakeTable> {
        let from = sql.find("FROM `")? + "FROM `".len();
        let end = sql[from..].find('`')? + from;
        state.tables.get(&sql[from..end])
    }
}

fn limit_offset(sql: &str) -> Option<(usize, u64)> {
    let mut words = sql.rsplit(' ');
    let offset = words.next()?.parse().ok()?;
    if words.next()? != "OFFSET" {
        return None;
    }
    let limit = words.next()?.parse().ok()?;
    Some((limit, offset))
}

#[async_trait]
impl SourceConnection for FakeConnection {
    fn system_id(&self) -> &str {
        &self.system_id
    }

    async fn query(&mut self, sql: &str, _timeout: Duration) -> Result<RowSet> {
        let delay = self.source.state.lock().unwrap().query_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.source.state.lock().unwrap();
        state.queries.push(sql.to_string());

        if sql == "SELECT 1" {
            return Ok(RowSet::new(vec!["1".to_string()], vec![vec![SqlValue::Int(1)]]));
        }

        if sql.starts_with("SELECT COUNT(*)") {
            if let Some(failure) = state.count_failures.pop_front() {
                return Err(failure.into_error(&self.system_id));
            }
            let table = Self::table_for(&state, sql)
                .ok_or_else(|| SyncError::permanent(&self.system_id, "Table doesn't exist"))?;
            let count = match (sql.contains(" WHERE "), table.window) {
                (true, Some(window)) => table.rows.iter().filter(|r| window(r)).count(),
                _ => table.rows.len(),
            };
            return Ok(RowSet::new(
                vec!["COUNT(*)".to_string()],
                vec![vec![SqlValue::Int(count as i64)]],
            ));
        }

        let (limit, offset) = limit_offset(sql).unwrap_or((usize::MAX, 0));
        if let Some(failure) = state
            .chunk_failures
            .get_mut(&offset)
            .and_then(|f| f.pop_front())
        {
            return Err(failure.into_error(&self.system_id));
        }
        let table = Self::table_for(&state, sql)
            .ok_or_else(|| SyncError::permanent(&self.system_id, "Table doesn't exist"))?;
        let rows = table
            .rows
            .iter()
            .filter(|r| match (sql.contains(" WHERE "), table.window) {
                (true, Some(window)) => window(r),
                _ => true,
            })
            .skip(offset as usize)
            .take(limit)
            .cloned()
            .collect();
        Ok(RowSet::new(table.column_names(), rows))
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        Ok(self.source.state.lock().unwrap().tables.keys().cloned().collect())
    }

    async fn describe_table(&mut self, table: &str) -> Result<Vec<SourceColumn>> {
        let state = self.source.state.lock().unwrap();
        if let Some(failure) = state.describe_failure {
            return Err(failure.into_error(&self.system_id));
        }
        state
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .ok_or_else(|| SyncError::permanent(&self.system_id, format!("Table '{}' doesn't exist", table)))
    }

    async fn primary_key(&mut self, table: &str) -> Result<Vec<String>> {
        let state = self.source.state.lock().unwrap();
        Ok(state
            .tables
            .get(table)
            .map(|t| t.primary_key.clone())
            .unwrap_or_default())
    }

    async fn catalog_row_count(&mut self, table: &str) -> Result<Option<u64>> {
        let state = self.source.state.lock().unwrap();
        Ok(state.tables.get(table).and_then(|t| t.catalog_rows))
    }

    async fn close(self: Box<Self>) {}
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        if let Ok(mut state) = self.source.state.lock() {
            state.open = state.open.saturating_sub(1);
        }
    }
}

/// A destination table held in memory.
#[derive(Debug, Clone, Default)]
pub struct WarehouseTable {
    pub schema: Vec<DestinationField>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

/// One recorded write call.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteCall {
    pub table: String,
    pub mode: WriteMode,
    pub rows: usize,
    pub schema_fields: usize,
}

#[derive(Default)]
struct WarehouseState {
    dataset_created: bool,
    tables: BTreeMap<String, WarehouseTable>,
    writes: Vec<WriteCall>,
    failed_write_calls: HashSet<usize>,
    write_calls: usize,
    statements: Vec<String>,
    added_fields: Vec<(String, Vec<String>)>,
    relaxed_fields: Vec<(String, Vec<String>)>,
    fail_statements: bool,
    delete_matcher: Option<fn(&[String], &[SqlValue]) -> bool>,
}

/// Warehouse double recording every call.
#[derive(Default)]
pub struct FakeWarehouse {
    state: Mutex<WarehouseState>,
}

impl FakeWarehouse {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create_table(&self, name: &str, table: WarehouseTable) {
        self.state
            .lock()
            .unwrap()
            .tables
            .insert(name.to_string(), table);
    }

    pub fn table(&self, name: &str) -> Option<WarehouseTable> {
        self.state.lock().unwrap().tables.get(name).cloned()
    }

    pub fn writes(&self) -> Vec<WriteCall> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }

    pub fn added_fields(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().added_fields.clone()
    }

    pub fn relaxed_fields(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().relaxed_fields.clone()
    }

    pub fn dataset_created(&self) -> bool {
        self.state.lock().unwrap().dataset_created
    }

    /// Fail the n-th write call (0-based, across all tables).
    pub fn fail_write_call(&self, n: usize) {
        self.state.lock().unwrap().failed_write_calls.insert(n);
    }

    pub fn fail_statements(&self) {
        self.state.lock().unwrap().fail_statements = true;
    }

    /// Rows matching this function are removed by DELETE statements.
    pub fn on_delete(&self, matcher: fn(&[String], &[SqlValue]) -> bool) {
        self.state.lock().unwrap().delete_matcher = Some(matcher);
    }
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create_dataset_if_absent(&self) -> Result<()> {
        self.state.lock().unwrap().dataset_created = true;
        Ok(())
    }

    async fn get_table_schema(&self, table: &str) -> Result<Option<Vec<DestinationField>>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|t| t.schema.clone()))
    }

    async fn add_fields(&self, table: &str, fields: &[DestinationField]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.added_fields.push((
            table.to_string(),
            fields.iter().map(|f| f.name.clone()).collect(),
        ));
        if let Some(t) = state.tables.get_mut(table) {
            t.schema.extend(fields.iter().cloned());
        }
        Ok(())
    }

    async fn relax_fields(&self, table: &str, fields: &[DestinationField]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.relaxed_fields.push((
            table.to_string(),
            fields.iter().map(|f| f.name.clone()).collect(),
        ));
        if let Some(t) = state.tables.get_mut(table) {
            for current in t.schema.iter_mut() {
                if fields.iter().any(|f| f.name.eq_ignore_ascii_case(&current.name)) {
                    current.mode = FieldMode::Nullable;
                }
            }
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
        let mut state = self.state.lock().unwrap();
        let call = state.write_calls;
        state.write_calls += 1;
        if state.failed_write_calls.contains(&call) {
            return Err(SyncError::write(table, "quota exceeded"));
        }
        state.writes.push(WriteCall {
            table: table.to_string(),
            mode,
            rows: chunk.len(),
            schema_fields: schema.len(),
        });
        let entry = state.tables.entry(table.to_string()).or_default();
        if mode == WriteMode::Replace {
            entry.rows.clear();
        }
        entry.schema = schema.to_vec();
        entry.columns = chunk.columns.clone();
        entry.rows.extend(chunk.rows.iter().cloned());
        Ok(())
    }

    async fn execute_statement(&self, sql: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.statements.push(sql.to_string());
        if state.fail_statements {
            return Err(SyncError::Destination("statement rejected".into()));
        }
        if let Some(rest) = sql.strip_prefix("DELETE FROM `test.ds.") {
            let name = rest.split('`').next().unwrap_or("").to_string();
            let matcher = state.delete_matcher;
            if let (Some(t), Some(matcher)) = (state.tables.get_mut(&name), matcher) {
                let columns = t.columns.clone();
                t.rows.retain(|r| !matcher(&columns, r));
            }
        }
        Ok(())
    }

    fn qualified_table(&self, table: &str) -> Result<String> {
        Ok(format!("`test.ds.{}`", table))
    }

    async fn row_count(&self, table: &str) -> Result<Option<u64>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|t| t.rows.len() as u64))
    }
}
