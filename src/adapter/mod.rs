//! Database adapters: per-engine bulk extract/load, schema introspection,
//! and staging-table handling.
//!
//! One implementation exists per engine (MySQL, PostgreSQL), selected by
//! the `engine` tag in the connection options at construction time. All
//! call sites go through the [`DatabaseAdapter`] trait object.

pub mod mysql;
pub mod postgres;
pub mod sql;
pub mod typemap;

use crate::config::ConnectionOptions;
use crate::error::{Result, SyncError};
use crate::plan::IndexSpec;
use crate::value::SqlValue;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::process::Stdio;

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    MySql,
    Postgres,
}

/// One column as reported by schema introspection, in table order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub sql_type: String,
    pub primary_key: bool,
    pub nullable: bool,
    pub default: Option<String>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            primary_key: false,
            nullable: true,
            default: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }
}

/// The column attributes compared between source and target. Type and
/// primary-key flag only; nullability, defaults, and auto-increment state
/// are not part of the comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashColumn {
    pub sql_type: String,
    pub primary_key: bool,
}

/// A single `column (>|>=) instant` bound. The instant is an epoch value in
/// the unit the column uses: seconds, or milliseconds when `in_millis`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampBound {
    pub column: String,
    pub epoch: i64,
    pub in_millis: bool,
    pub inclusive: bool,
}

impl TimestampBound {
    pub fn after(column: impl Into<String>, epoch: i64, in_millis: bool) -> Self {
        Self {
            column: column.into(),
            epoch,
            in_millis,
            inclusive: false,
        }
    }

    pub fn at_or_after(column: impl Into<String>, epoch: i64, in_millis: bool) -> Self {
        Self {
            column: column.into(),
            epoch,
            in_millis,
            inclusive: true,
        }
    }
}

/// Row filter for extracts and window deletes. Bounds are a conjunction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    Bounds(Vec<TimestampBound>),
}

impl Filter {
    pub fn newer_than(column: impl Into<String>, epoch: i64, in_millis: bool) -> Self {
        Filter::Bounds(vec![TimestampBound::after(column, epoch, in_millis)])
    }
}

/// A typed extract request. Adapters render this into their own dialect;
/// keeping the SQL rendering in one place keeps quoting auditable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractQuery {
    pub table: String,
    pub columns: Vec<String>,
    pub filter: Filter,
}

/// Capability set every engine implements. Dispatch happens once, at
/// construction; the engine tag is only consulted for SQL rendering.
#[async_trait]
pub trait DatabaseAdapter: Send {
    fn engine(&self) -> Engine;

    /// Close the underlying connection. The next statement sees a live
    /// connection; the target sits idle for long periods during extract
    /// and stale connections error out otherwise.
    async fn connection_reset(&mut self) -> Result<()>;

    async fn list_tables(&mut self) -> Result<Vec<String>>;

    async fn table_exists(&mut self, table: &str) -> Result<bool>;

    /// Ordered column list. Errors with [`SyncError::NoSuchTable`] when the
    /// relation is missing.
    async fn schema(&mut self, table: &str) -> Result<Vec<ColumnInfo>>;

    /// Secondary indexes by name; the primary key is not included.
    async fn indexes(&mut self, table: &str) -> Result<BTreeMap<String, IndexSpec>>;

    /// The subset of the schema used to compare source and target
    /// compatibility.
    async fn hash_schema(&mut self, table: &str) -> Result<BTreeMap<String, HashColumn>> {
        let columns = self.schema(table).await?;
        Ok(columns
            .into_iter()
            .map(|c| {
                (
                    c.name,
                    HashColumn {
                        sql_type: typemap::canonical(&c.sql_type),
                        primary_key: c.primary_key,
                    },
                )
            })
            .collect())
    }

    /// Run the engine client writing delimited query output to `file`.
    /// Non-empty stderr is a failure even when the exit status is zero.
    async fn extract_to_file(
        &mut self,
        query: &ExtractQuery,
        file: &Path,
        charset: Option<&str>,
    ) -> Result<()>;

    /// Bulk-ingest a delimited file. Duplicate keys are silently ignored
    /// so incremental catch-up is idempotent on primary key.
    async fn load_from_file(&mut self, table: &str, columns: &[String], file: &Path)
        -> Result<()>;

    /// Create a table from introspected source columns, normalizing types
    /// for this engine. Primary key included, no secondary indexes.
    async fn create_table(
        &mut self,
        name: &str,
        columns: &[ColumnInfo],
        charset: Option<&str>,
    ) -> Result<()>;

    async fn create_table_like(&mut self, new: &str, existing: &str) -> Result<()>;

    async fn drop_table_if_exists(&mut self, name: &str) -> Result<()>;

    /// Atomic rename making `staging` the live table; readers observe the
    /// old or the new table, never neither. The old table is dropped after
    /// the swap.
    async fn switch_table(&mut self, staging: &str, live: &str) -> Result<()>;

    async fn add_column(&mut self, table: &str, column: &str, sql_type: &str) -> Result<()>;

    async fn add_index(&mut self, table: &str, name: &str, spec: &IndexSpec) -> Result<()>;

    /// Drop every secondary index whose declared name is not in `keep`.
    async fn remove_indexes_except(&mut self, table: &str, keep: &BTreeSet<String>)
        -> Result<()>;

    /// Delete rows matching the filter; returns the number deleted.
    async fn delete_where(&mut self, table: &str, filter: &Filter) -> Result<u64>;

    /// Maximum of a timestamp column as an epoch value in source units, or
    /// `None` for an empty table.
    async fn max_timestamp(
        &mut self,
        table: &str,
        column: &str,
        in_millis: bool,
    ) -> Result<Option<i64>>;

    // Keyed scalar I/O used by the registry.

    async fn select_row(
        &mut self,
        table: &str,
        key_column: &str,
        key: &str,
        columns: &[&str],
    ) -> Result<Option<Vec<SqlValue>>>;

    async fn select_all(&mut self, table: &str, columns: &[&str]) -> Result<Vec<Vec<SqlValue>>>;

    async fn delete_row(&mut self, table: &str, key_column: &str, key: &str) -> Result<()>;

    async fn upsert(
        &mut self,
        table: &str,
        key_column: &str,
        key: &str,
        assignments: &[(String, SqlValue)],
    ) -> Result<()>;
}

/// Connection factory, injectable so tests can hand out in-memory adapters.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Box<dyn DatabaseAdapter>>;
}

/// Production connector dispatching on the engine tag.
pub struct DriverConnector;

#[async_trait]
impl Connector for DriverConnector {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Box<dyn DatabaseAdapter>> {
        match options.engine {
            Engine::MySql => Ok(Box::new(mysql::MysqlAdapter::new(options.clone()))),
            Engine::Postgres => Ok(Box::new(postgres::PostgresAdapter::new(options.clone()))),
        }
    }
}

/// Run an engine client with stderr captured to a file. Failure is
/// non-zero exit OR non-empty stderr; either alone is sufficient, because
/// some engines swallow SQL errors into stdout with exit 0 when reading
/// from a script.
pub(crate) async fn run_client(
    mut command: tokio::process::Command,
    stdout_to: Option<&Path>,
) -> anyhow::Result<()> {
    let stderr_capture =
        tempfile::NamedTempFile::new().context("creating stderr capture file")?;
    let stderr_handle = stderr_capture
        .reopen()
        .context("reopening stderr capture file")?;

    command.stdin(Stdio::null());
    command.stderr(Stdio::from(stderr_handle));
    match stdout_to {
        Some(path) => {
            let out = std::fs::File::create(path)
                .with_context(|| format!("creating extract file {}", path.display()))?;
            command.stdout(Stdio::from(out));
        }
        None => {
            command.stdout(Stdio::null());
        }
    }

    let status = command.status().await.context("spawning engine client")?;
    let stderr = std::fs::read_to_string(stderr_capture.path()).unwrap_or_default();
    let stderr = stderr.trim();

    if !status.success() {
        anyhow::bail!("engine client exited with {status}: {stderr}");
    }
    if !stderr.is_empty() {
        anyhow::bail!("engine client wrote to stderr: {stderr}");
    }
    Ok(())
}

/// Map a driver-level "relation missing" failure onto the taxonomy.
pub(crate) fn no_such_table(table: &str) -> SyncError {
    SyncError::NoSuchTable(table.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_client_rejects_nonzero_exit() {
        let mut cmd = tokio::process::Command::new("false");
        cmd.arg("ignored");
        let err = run_client(cmd, None).await.unwrap_err();
        assert!(err.to_string().contains("exited"));
    }

    #[tokio::test]
    async fn test_run_client_rejects_stderr_despite_exit_zero() {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "echo oops >&2; exit 0"]);
        let err = run_client(cmd, None).await.unwrap_err();
        assert!(err.to_string().contains("oops"));
    }

    #[tokio::test]
    async fn test_run_client_captures_stdout_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.tsv");
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "printf 'a\\tb\\n'"]);
        run_client(cmd, Some(&out)).await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "a\tb\n");
    }

    #[test]
    fn test_filter_newer_than() {
        let filter = Filter::newer_than("updated_at", 100, false);
        match filter {
            Filter::Bounds(bounds) => {
                assert_eq!(bounds.len(), 1);
                assert!(!bounds[0].inclusive);
                assert_eq!(bounds[0].epoch, 100);
            }
            Filter::All => panic!("expected bounds"),
        }
    }
}
