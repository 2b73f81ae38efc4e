//! Test support: an in-memory [`DatabaseAdapter`] and fixture helpers.
//!
//! The memory adapter speaks the same delimited-file contract as the real
//! engines, so the pipeline and the action state machines run end-to-end
//! in the test suites without live servers. Timestamp columns hold bare
//! epoch integers in whatever unit the exercised plan uses.

use crate::adapter::{
    ColumnInfo, Connector, DatabaseAdapter, Engine, ExtractQuery, Filter,
};
use crate::config::ConnectionOptions;
use crate::error::{Result, SyncError};
use crate::plan::IndexSpec;
use crate::value::SqlValue;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub type Row = BTreeMap<String, SqlValue>;

#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub columns: Vec<ColumnInfo>,
    pub indexes: BTreeMap<String, IndexSpec>,
    pub rows: Vec<Row>,
}

impl MemoryTable {
    fn primary_key(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    fn key_of(row: &Row, columns: &[String]) -> Vec<SqlValue> {
        columns
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(SqlValue::Null))
            .collect()
    }

    /// Insert honoring primary-key and unique-index tolerance: a row whose
    /// key already exists is silently dropped, like the bulk loaders do.
    fn insert_ignoring_duplicates(&mut self, row: Row) -> bool {
        let pk = self.primary_key();
        if !pk.is_empty() {
            let key = Self::key_of(&row, &pk);
            if self.rows.iter().any(|r| Self::key_of(r, &pk) == key) {
                return false;
            }
        }
        for spec in self.indexes.values().filter(|s| s.unique) {
            let key = Self::key_of(&row, &spec.columns);
            if self
                .rows
                .iter()
                .any(|r| Self::key_of(r, &spec.columns) == key)
            {
                return false;
            }
        }
        self.rows.push(row);
        true
    }
}

#[derive(Debug, Default)]
pub struct MemoryDb {
    pub tables: BTreeMap<String, MemoryTable>,
}

pub type SharedDb = Arc<Mutex<MemoryDb>>;

impl MemoryDb {
    pub fn shared() -> SharedDb {
        Arc::new(Mutex::new(MemoryDb::default()))
    }
}

/// Define a table from `(name, sql_type, primary_key)` triples.
pub fn define_table(db: &SharedDb, table: &str, columns: &[(&str, &str, bool)]) {
    let columns = columns
        .iter()
        .map(|(name, sql_type, pk)| {
            if *pk {
                ColumnInfo::new(*name, *sql_type).primary_key()
            } else {
                ColumnInfo::new(*name, *sql_type)
            }
        })
        .collect();
    db.lock().unwrap().tables.insert(
        table.to_string(),
        MemoryTable {
            columns,
            ..Default::default()
        },
    );
}

pub fn insert_row(db: &SharedDb, table: &str, values: &[(&str, SqlValue)]) {
    let row: Row = values
        .iter()
        .map(|(c, v)| (c.to_string(), v.clone()))
        .collect();
    db.lock()
        .unwrap()
        .tables
        .get_mut(table)
        .expect("table defined")
        .rows
        .push(row);
}

pub fn drop_column(db: &SharedDb, table: &str, column: &str) {
    let mut db = db.lock().unwrap();
    let table = db.tables.get_mut(table).expect("table defined");
    table.columns.retain(|c| c.name != column);
    for row in &mut table.rows {
        row.remove(column);
    }
}

pub fn table_rows(db: &SharedDb, table: &str) -> Vec<Row> {
    db.lock()
        .unwrap()
        .tables
        .get(table)
        .map(|t| t.rows.clone())
        .unwrap_or_default()
}

pub fn table_exists_in(db: &SharedDb, table: &str) -> bool {
    db.lock().unwrap().tables.contains_key(table)
}

/// In-memory adapter backed by a [`SharedDb`], sharable between the
/// "source" and "target" roles of a test.
pub struct MemoryAdapter {
    db: SharedDb,
    engine: Engine,
    fail_extracts: bool,
    pub resets: u64,
}

impl MemoryAdapter {
    pub fn new(db: SharedDb, engine: Engine) -> Self {
        Self {
            db,
            engine,
            fail_extracts: false,
            resets: 0,
        }
    }

    /// Every extract fails as if the engine client had written to stderr.
    pub fn with_failing_extracts(mut self, fail: bool) -> Self {
        self.fail_extracts = fail;
        self
    }

    fn column_type(&self, table: &str, column: &str) -> Option<String> {
        self.db
            .lock()
            .unwrap()
            .tables
            .get(table)?
            .columns
            .iter()
            .find(|c| c.name == column)
            .map(|c| c.sql_type.clone())
    }

    fn parse_token(sql_type: &str, token: &str) -> SqlValue {
        if token == "NULL" {
            return SqlValue::Null;
        }
        let lowered = sql_type.to_lowercase();
        if lowered.contains("int") || lowered.contains("serial") {
            token
                .parse::<i64>()
                .map(SqlValue::Int)
                .unwrap_or_else(|_| SqlValue::Text(token.to_string()))
        } else if lowered.contains("double")
            || lowered.contains("float")
            || lowered.contains("real")
        {
            token
                .parse::<f64>()
                .map(SqlValue::Float)
                .unwrap_or_else(|_| SqlValue::Text(token.to_string()))
        } else {
            SqlValue::Text(token.to_string())
        }
    }

    fn render_token(value: &SqlValue) -> String {
        match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Int(n) => n.to_string(),
            SqlValue::Float(f) => f.to_string(),
            SqlValue::Text(s) => s.clone(),
        }
    }

    fn matches(row: &Row, filter: &Filter) -> bool {
        match filter {
            Filter::All => true,
            Filter::Bounds(bounds) => bounds.iter().all(|bound| {
                match row.get(&bound.column).and_then(|v| v.as_i64()) {
                    Some(v) if bound.inclusive => v >= bound.epoch,
                    Some(v) => v > bound.epoch,
                    None => false,
                }
            }),
        }
    }
}

#[async_trait]
impl DatabaseAdapter for MemoryAdapter {
    fn engine(&self) -> Engine {
        self.engine
    }

    async fn connection_reset(&mut self) -> Result<()> {
        self.resets += 1;
        Ok(())
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        Ok(self.db.lock().unwrap().tables.keys().cloned().collect())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        Ok(self.db.lock().unwrap().tables.contains_key(table))
    }

    async fn schema(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        self.db
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .ok_or_else(|| SyncError::NoSuchTable(table.to_string()))
    }

    async fn indexes(&mut self, table: &str) -> Result<BTreeMap<String, IndexSpec>> {
        self.db
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|t| t.indexes.clone())
            .ok_or_else(|| SyncError::NoSuchTable(table.to_string()))
    }

    async fn extract_to_file(
        &mut self,
        query: &ExtractQuery,
        file: &Path,
        _charset: Option<&str>,
    ) -> Result<()> {
        if self.fail_extracts {
            return Err(SyncError::extract(
                &query.table,
                anyhow::anyhow!("engine client wrote to stderr: simulated failure"),
            ));
        }
        let db = self.db.lock().unwrap();
        let table = db
            .tables
            .get(&query.table)
            .ok_or_else(|| SyncError::NoSuchTable(query.table.clone()))?;

        let mut out = String::new();
        for row in table
            .rows
            .iter()
            .filter(|r| Self::matches(r, &query.filter))
        {
            let line = query
                .columns
                .iter()
                .map(|c| Self::render_token(row.get(c).unwrap_or(&SqlValue::Null)))
                .collect::<Vec<_>>()
                .join("\t");
            out.push_str(&line);
            out.push('\n');
        }
        drop(db);
        std::fs::write(file, out)
            .map_err(|e| SyncError::extract(&query.table, anyhow::Error::from(e)))
    }

    async fn load_from_file(
        &mut self,
        table: &str,
        columns: &[String],
        file: &Path,
    ) -> Result<()> {
        let content = std::fs::read_to_string(file)
            .map_err(|e| SyncError::load(table, anyhow::Error::from(e)))?;
        let types: Vec<String> = columns
            .iter()
            .map(|c| self.column_type(table, c).unwrap_or_else(|| "text".into()))
            .collect();

        let mut db = self.db.lock().unwrap();
        let table_data = db
            .tables
            .get_mut(table)
            .ok_or_else(|| SyncError::NoSuchTable(table.to_string()))?;

        for line in content.lines() {
            let tokens: Vec<&str> = line.split('\t').collect();
            let row: Row = columns
                .iter()
                .zip(types.iter())
                .enumerate()
                .map(|(i, (column, sql_type))| {
                    let token = tokens.get(i).copied().unwrap_or("NULL");
                    (column.clone(), Self::parse_token(sql_type, token))
                })
                .collect();
            table_data.insert_ignoring_duplicates(row);
        }
        Ok(())
    }

    async fn create_table(
        &mut self,
        name: &str,
        columns: &[ColumnInfo],
        _charset: Option<&str>,
    ) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        if db.tables.contains_key(name) {
            return Err(SyncError::load(
                name,
                anyhow::anyhow!("table \"{name}\" already exists"),
            ));
        }
        db.tables.insert(
            name.to_string(),
            MemoryTable {
                columns: columns.to_vec(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn create_table_like(&mut self, new: &str, existing: &str) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let template = db
            .tables
            .get(existing)
            .ok_or_else(|| SyncError::NoSuchTable(existing.to_string()))?;
        let copy = MemoryTable {
            columns: template.columns.clone(),
            indexes: template.indexes.clone(),
            rows: Vec::new(),
        };
        db.tables.insert(new.to_string(), copy);
        Ok(())
    }

    async fn drop_table_if_exists(&mut self, name: &str) -> Result<()> {
        self.db.lock().unwrap().tables.remove(name);
        Ok(())
    }

    async fn switch_table(&mut self, staging: &str, live: &str) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let table = db
            .tables
            .remove(staging)
            .ok_or_else(|| SyncError::NoSuchTable(staging.to_string()))?;
        db.tables.insert(live.to_string(), table);
        Ok(())
    }

    async fn add_column(&mut self, table: &str, column: &str, sql_type: &str) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let table = db
            .tables
            .get_mut(table)
            .ok_or_else(|| SyncError::NoSuchTable(table.to_string()))?;
        table.columns.push(ColumnInfo::new(column, sql_type));
        Ok(())
    }

    async fn add_index(&mut self, table: &str, name: &str, spec: &IndexSpec) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let table = db
            .tables
            .get_mut(table)
            .ok_or_else(|| SyncError::NoSuchTable(table.to_string()))?;
        table.indexes.insert(name.to_string(), spec.clone());
        Ok(())
    }

    async fn remove_indexes_except(
        &mut self,
        table: &str,
        keep: &BTreeSet<String>,
    ) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let table = db
            .tables
            .get_mut(table)
            .ok_or_else(|| SyncError::NoSuchTable(table.to_string()))?;
        table.indexes.retain(|name, _| keep.contains(name));
        Ok(())
    }

    async fn delete_where(&mut self, table: &str, filter: &Filter) -> Result<u64> {
        let mut db = self.db.lock().unwrap();
        let table = db
            .tables
            .get_mut(table)
            .ok_or_else(|| SyncError::NoSuchTable(table.to_string()))?;
        let before = table.rows.len();
        table.rows.retain(|r| !Self::matches(r, filter));
        Ok((before - table.rows.len()) as u64)
    }

    async fn max_timestamp(
        &mut self,
        table: &str,
        column: &str,
        _in_millis: bool,
    ) -> Result<Option<i64>> {
        let db = self.db.lock().unwrap();
        let table = db
            .tables
            .get(table)
            .ok_or_else(|| SyncError::NoSuchTable(table.to_string()))?;
        Ok(table
            .rows
            .iter()
            .filter_map(|r| r.get(column).and_then(|v| v.as_i64()))
            .max())
    }

    async fn select_row(
        &mut self,
        table: &str,
        key_column: &str,
        key: &str,
        columns: &[&str],
    ) -> Result<Option<Vec<SqlValue>>> {
        let db = self.db.lock().unwrap();
        let table = db
            .tables
            .get(table)
            .ok_or_else(|| SyncError::NoSuchTable(table.to_string()))?;
        let key = SqlValue::Text(key.to_string());
        Ok(table
            .rows
            .iter()
            .find(|r| r.get(key_column) == Some(&key))
            .map(|row| {
                columns
                    .iter()
                    .map(|c| row.get(*c).cloned().unwrap_or(SqlValue::Null))
                    .collect()
            }))
    }

    async fn select_all(&mut self, table: &str, columns: &[&str]) -> Result<Vec<Vec<SqlValue>>> {
        let db = self.db.lock().unwrap();
        let table = db
            .tables
            .get(table)
            .ok_or_else(|| SyncError::NoSuchTable(table.to_string()))?;
        Ok(table
            .rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| row.get(*c).cloned().unwrap_or(SqlValue::Null))
                    .collect()
            })
            .collect())
    }

    async fn delete_row(&mut self, table: &str, key_column: &str, key: &str) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let table = db
            .tables
            .get_mut(table)
            .ok_or_else(|| SyncError::NoSuchTable(table.to_string()))?;
        let key = SqlValue::Text(key.to_string());
        table.rows.retain(|r| r.get(key_column) != Some(&key));
        Ok(())
    }

    async fn upsert(
        &mut self,
        table: &str,
        key_column: &str,
        key: &str,
        assignments: &[(String, SqlValue)],
    ) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let table = db
            .tables
            .get_mut(table)
            .ok_or_else(|| SyncError::NoSuchTable(table.to_string()))?;
        let key = SqlValue::Text(key.to_string());
        if let Some(row) = table
            .rows
            .iter_mut()
            .find(|r| r.get(key_column) == Some(&key))
        {
            for (column, value) in assignments {
                row.insert(column.clone(), value.clone());
            }
        } else {
            let mut row = Row::new();
            row.insert(key_column.to_string(), key);
            for (column, value) in assignments {
                row.insert(column.clone(), value.clone());
            }
            table.rows.push(row);
        }
        Ok(())
    }
}

/// Connector handing out memory adapters, keyed by database name so a
/// source and a target in the same test resolve to distinct stores.
#[derive(Default)]
pub struct MemoryConnector {
    dbs: Mutex<HashMap<String, SharedDb>>,
    fail_extracts: bool,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_extracts() -> Self {
        Self {
            dbs: Mutex::new(HashMap::new()),
            fail_extracts: true,
        }
    }

    /// The store behind `database`, creating it on first use.
    pub fn db(&self, database: &str) -> SharedDb {
        self.dbs
            .lock()
            .unwrap()
            .entry(database.to_string())
            .or_insert_with(MemoryDb::shared)
            .clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Box<dyn DatabaseAdapter>> {
        let db = self.db(&options.database);
        Ok(Box::new(
            MemoryAdapter::new(db, options.engine).with_failing_extracts(self.fail_extracts),
        ))
    }
}
