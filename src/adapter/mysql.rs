//! MySQL adapter.
//!
//! Queries and introspection go through `mysql_async`; bulk extract and
//! load shell out to the `mysql` client in batch mode, which produces and
//! consumes tab-delimited text. Extract sessions pin the session timezone
//! to UTC so timestamp values are canonicalized.

use super::{
    no_such_table, run_client, ColumnInfo, DatabaseAdapter, Engine, ExtractQuery, Filter,
    typemap,
};
use crate::config::ConnectionOptions;
use crate::error::{Result, SyncError};
use crate::plan::IndexSpec;
use crate::value::SqlValue;
use async_trait::async_trait;
use mysql_async::{prelude::*, Conn, Opts, OptsBuilder, Row, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

pub struct MysqlAdapter {
    options: ConnectionOptions,
    conn: Option<Conn>,
}

impl MysqlAdapter {
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            conn: None,
        }
    }

    fn opts(&self) -> Opts {
        let builder = OptsBuilder::default()
            .ip_or_hostname(self.options.host.clone())
            .tcp_port(self.options.resolved_port())
            .user(Some(self.options.user.clone()))
            .pass(Some(self.options.password.clone()))
            .db_name(Some(self.options.database.clone()));
        Opts::from(builder)
    }

    async fn conn(&mut self) -> anyhow::Result<&mut Conn> {
        if self.conn.is_none() {
            let mut conn = Conn::new(self.opts()).await?;
            if let Some(charset) = &self.options.charset {
                conn.query_drop(format!(
                    "SET NAMES {}",
                    Engine::MySql.quote_literal(charset)
                ))
                .await?;
            }
            self.conn = Some(conn);
        }
        Ok(self.conn.as_mut().expect("connection just established"))
    }

    /// Base `mysql` client invocation. The SQL travels as a single argv
    /// element and the password through the environment, so nothing is
    /// interpolated through a shell.
    fn client_command(&self, charset: Option<&str>) -> Command {
        let mut cmd = Command::new("mysql");
        cmd.arg("--batch")
            .arg("--skip-column-names")
            .arg("--host")
            .arg(&self.options.host)
            .arg("--port")
            .arg(self.options.resolved_port().to_string())
            .arg("--user")
            .arg(&self.options.user);
        if let Some(charset) = charset.or(self.options.charset.as_deref()) {
            cmd.arg(format!("--default-character-set={charset}"));
        }
        cmd.arg(&self.options.database);
        cmd.env("MYSQL_PWD", &self.options.password);
        cmd
    }

    fn value_to_sql(value: Value) -> SqlValue {
        match value {
            Value::NULL => SqlValue::Null,
            Value::Int(n) => SqlValue::Int(n),
            Value::UInt(n) => SqlValue::Int(n as i64),
            Value::Float(f) => SqlValue::Float(f as f64),
            Value::Double(d) => SqlValue::Float(d),
            Value::Bytes(b) => SqlValue::Text(String::from_utf8_lossy(&b).into_owned()),
            other => SqlValue::Text(format!("{other:?}")),
        }
    }
}

#[async_trait]
impl DatabaseAdapter for MysqlAdapter {
    fn engine(&self) -> Engine {
        Engine::MySql
    }

    async fn connection_reset(&mut self) -> Result<()> {
        // Dropping the connection closes it; the next statement
        // reconnects lazily.
        self.conn = None;
        Ok(())
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        let database = self.options.database.clone();
        let conn = self
            .conn()
            .await
            .map_err(|e| SyncError::extract(&database, e))?;
        let tables: Vec<String> = conn
            .exec(
                "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' \
                 ORDER BY TABLE_NAME",
                (),
            )
            .await
            .map_err(|e| SyncError::extract(&database, e))?;
        Ok(tables)
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        let conn = self.conn().await.map_err(|e| SyncError::extract(table, e))?;
        let count: Option<i64> = conn
            .exec_first(
                "SELECT COUNT(*) FROM INFORMATION_SCHEMA.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?",
                (table,),
            )
            .await
            .map_err(|e| SyncError::extract(table, e))?;
        Ok(count.unwrap_or(0) > 0)
    }

    async fn schema(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        let conn = self.conn().await.map_err(|e| SyncError::extract(table, e))?;
        let rows: Vec<Row> = conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_TYPE, COLUMN_KEY, IS_NULLABLE, COLUMN_DEFAULT \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (table,),
            )
            .await
            .map_err(|e| SyncError::extract(table, e))?;

        if rows.is_empty() {
            return Err(no_such_table(table));
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get(0).unwrap_or_default();
            let sql_type: String = row.get(1).unwrap_or_default();
            let key: String = row.get(2).unwrap_or_default();
            let nullable: String = row.get(3).unwrap_or_default();
            let default: Option<String> = row.get(4).unwrap_or(None);
            columns.push(ColumnInfo {
                name,
                sql_type,
                primary_key: key == "PRI",
                nullable: nullable == "YES",
                default,
            });
        }
        Ok(columns)
    }

    async fn indexes(&mut self, table: &str) -> Result<BTreeMap<String, IndexSpec>> {
        let conn = self.conn().await.map_err(|e| SyncError::extract(table, e))?;
        let rows: Vec<Row> = conn
            .exec(
                "SELECT INDEX_NAME, COLUMN_NAME, NON_UNIQUE \
                 FROM INFORMATION_SCHEMA.STATISTICS \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
                   AND INDEX_NAME <> 'PRIMARY' \
                 ORDER BY INDEX_NAME, SEQ_IN_INDEX",
                (table,),
            )
            .await
            .map_err(|e| SyncError::extract(table, e))?;

        let mut indexes: BTreeMap<String, IndexSpec> = BTreeMap::new();
        for row in rows {
            let name: String = row.get(0).unwrap_or_default();
            let column: String = row.get(1).unwrap_or_default();
            let non_unique: i64 = row.get(2).unwrap_or(1);
            let entry = indexes.entry(name).or_insert_with(|| IndexSpec {
                columns: Vec::new(),
                unique: non_unique == 0,
            });
            entry.columns.push(column);
        }
        Ok(indexes)
    }

    async fn extract_to_file(
        &mut self,
        query: &ExtractQuery,
        file: &Path,
        charset: Option<&str>,
    ) -> Result<()> {
        let select = Engine::MySql.render_select(query);
        debug!(table = %query.table, "mysql extract: {select}");
        let mut cmd = self.client_command(charset);
        cmd.arg("-e")
            .arg(format!("SET time_zone = '+00:00'; {select}"));
        run_client(cmd, Some(file))
            .await
            .map_err(|e| SyncError::extract(&query.table, e))
    }

    async fn load_from_file(
        &mut self,
        table: &str,
        columns: &[String],
        file: &Path,
    ) -> Result<()> {
        let engine = Engine::MySql;
        // Batch-mode output spells NULL as the bare word; restore it on the
        // way in through user variables.
        let vars = (0..columns.len())
            .map(|i| format!("@v{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sets = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = NULLIF(@v{i}, 'NULL')", engine.quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let load = format!(
            "LOAD DATA LOCAL INFILE {path} IGNORE INTO TABLE {table} ({vars}) SET {sets}",
            path = engine.quote_literal(&file.display().to_string()),
            table = engine.quote_ident(table),
        );
        debug!(table, "mysql load: {load}");
        let mut cmd = self.client_command(None);
        cmd.arg("--local-infile=1")
            .arg("-e")
            .arg(format!("SET time_zone = '+00:00'; {load}"));
        run_client(cmd, None)
            .await
            .map_err(|e| SyncError::load(table, e))
    }

    async fn create_table(
        &mut self,
        name: &str,
        columns: &[ColumnInfo],
        charset: Option<&str>,
    ) -> Result<()> {
        let engine = Engine::MySql;
        let mut defs: Vec<String> = columns
            .iter()
            .map(|c| {
                let null = if c.primary_key { " NOT NULL" } else { "" };
                format!(
                    "{} {}{null}",
                    engine.quote_ident(&c.name),
                    typemap::render_type(engine, &c.sql_type)
                )
            })
            .collect();
        let pk: Vec<String> = columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| engine.quote_ident(&c.name))
            .collect();
        if !pk.is_empty() {
            defs.push(format!("PRIMARY KEY ({})", pk.join(", ")));
        }
        let mut sql = format!("CREATE TABLE {} ({})", engine.quote_ident(name), defs.join(", "));
        if let Some(charset) = charset {
            sql.push_str(&format!(
                " DEFAULT CHARACTER SET {}",
                engine.quote_ident(charset)
            ));
        }
        let conn = self.conn().await.map_err(|e| SyncError::load(name, e))?;
        conn.query_drop(sql)
            .await
            .map_err(|e| SyncError::load(name, e))
    }

    async fn create_table_like(&mut self, new: &str, existing: &str) -> Result<()> {
        let sql = format!(
            "CREATE TABLE {} LIKE {}",
            Engine::MySql.quote_ident(new),
            Engine::MySql.quote_ident(existing)
        );
        let conn = self.conn().await.map_err(|e| SyncError::load(new, e))?;
        conn.query_drop(sql).await.map_err(|e| SyncError::load(new, e))
    }

    async fn drop_table_if_exists(&mut self, name: &str) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", Engine::MySql.quote_ident(name));
        let conn = self.conn().await.map_err(|e| SyncError::load(name, e))?;
        conn.query_drop(sql).await.map_err(|e| SyncError::load(name, e))
    }

    async fn switch_table(&mut self, staging: &str, live: &str) -> Result<()> {
        let engine = Engine::MySql;
        if self.table_exists(live).await? {
            let retired = format!("old_{live}_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
            let rename = format!(
                "RENAME TABLE {live} TO {retired}, {staging} TO {live}",
                live = engine.quote_ident(live),
                retired = engine.quote_ident(&retired),
                staging = engine.quote_ident(staging),
            );
            let conn = self.conn().await.map_err(|e| SyncError::load(live, e))?;
            conn.query_drop(rename)
                .await
                .map_err(|e| SyncError::load(live, e))?;
            self.drop_table_if_exists(&retired).await
        } else {
            let rename = format!(
                "RENAME TABLE {} TO {}",
                engine.quote_ident(staging),
                engine.quote_ident(live)
            );
            let conn = self.conn().await.map_err(|e| SyncError::load(live, e))?;
            conn.query_drop(rename)
                .await
                .map_err(|e| SyncError::load(live, e))
        }
    }

    async fn add_column(&mut self, table: &str, column: &str, sql_type: &str) -> Result<()> {
        let engine = Engine::MySql;
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            engine.quote_ident(table),
            engine.quote_ident(column),
            typemap::render_type(engine, sql_type)
        );
        let conn = self.conn().await.map_err(|e| SyncError::load(table, e))?;
        conn.query_drop(sql)
            .await
            .map_err(|e| SyncError::load(table, e))
    }

    async fn add_index(&mut self, table: &str, name: &str, spec: &IndexSpec) -> Result<()> {
        let engine = Engine::MySql;
        let unique = if spec.unique { "UNIQUE " } else { "" };
        let columns = spec
            .columns
            .iter()
            .map(|c| engine.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "ALTER TABLE {} ADD {unique}INDEX {} ({columns})",
            engine.quote_ident(table),
            engine.quote_ident(name),
        );
        let conn = self.conn().await.map_err(|e| SyncError::load(table, e))?;
        conn.query_drop(sql)
            .await
            .map_err(|e| SyncError::load(table, e))
    }

    async fn remove_indexes_except(
        &mut self,
        table: &str,
        keep: &BTreeSet<String>,
    ) -> Result<()> {
        let existing = self.indexes(table).await?;
        for name in existing.keys().filter(|n| !keep.contains(*n)) {
            let sql = format!(
                "ALTER TABLE {} DROP INDEX {}",
                Engine::MySql.quote_ident(table),
                Engine::MySql.quote_ident(name)
            );
            let conn = self.conn().await.map_err(|e| SyncError::load(table, e))?;
            conn.query_drop(sql)
                .await
                .map_err(|e| SyncError::load(table, e))?;
        }
        Ok(())
    }

    async fn delete_where(&mut self, table: &str, filter: &Filter) -> Result<u64> {
        let sql = Engine::MySql.render_delete(table, filter);
        let conn = self.conn().await.map_err(|e| SyncError::load(table, e))?;
        conn.query_drop(sql)
            .await
            .map_err(|e| SyncError::load(table, e))?;
        Ok(conn.affected_rows())
    }

    async fn max_timestamp(
        &mut self,
        table: &str,
        column: &str,
        in_millis: bool,
    ) -> Result<Option<i64>> {
        let sql = Engine::MySql.render_max_timestamp(table, column, in_millis);
        let conn = self.conn().await.map_err(|e| SyncError::extract(table, e))?;
        let max: Option<Option<i64>> = conn
            .query_first(sql)
            .await
            .map_err(|e| SyncError::extract(table, e))?;
        Ok(max.flatten())
    }

    async fn select_row(
        &mut self,
        table: &str,
        key_column: &str,
        key: &str,
        columns: &[&str],
    ) -> Result<Option<Vec<SqlValue>>> {
        let engine = Engine::MySql;
        let cols = columns
            .iter()
            .map(|c| engine.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {cols} FROM {} WHERE {} = {} LIMIT 1",
            engine.quote_ident(table),
            engine.quote_ident(key_column),
            engine.quote_literal(key)
        );
        let conn = self.conn().await.map_err(|e| SyncError::load(table, e))?;
        let row: Option<Row> = conn
            .query_first(sql)
            .await
            .map_err(|e| SyncError::load(table, e))?;
        Ok(row.map(|row| {
            (0..columns.len())
                .map(|i| Self::value_to_sql(row.as_ref(i).cloned().unwrap_or(Value::NULL)))
                .collect()
        }))
    }

    async fn select_all(&mut self, table: &str, columns: &[&str]) -> Result<Vec<Vec<SqlValue>>> {
        let engine = Engine::MySql;
        let cols = columns
            .iter()
            .map(|c| engine.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {cols} FROM {}", engine.quote_ident(table));
        let conn = self.conn().await.map_err(|e| SyncError::load(table, e))?;
        let rows: Vec<Row> = conn
            .query(sql)
            .await
            .map_err(|e| SyncError::load(table, e))?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (0..columns.len())
                    .map(|i| Self::value_to_sql(row.as_ref(i).cloned().unwrap_or(Value::NULL)))
                    .collect()
            })
            .collect())
    }

    async fn delete_row(&mut self, table: &str, key_column: &str, key: &str) -> Result<()> {
        let engine = Engine::MySql;
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            engine.quote_ident(table),
            engine.quote_ident(key_column),
            engine.quote_literal(key)
        );
        let conn = self.conn().await.map_err(|e| SyncError::load(table, e))?;
        conn.query_drop(sql)
            .await
            .map_err(|e| SyncError::load(table, e))
    }

    async fn upsert(
        &mut self,
        table: &str,
        key_column: &str,
        key: &str,
        assignments: &[(String, SqlValue)],
    ) -> Result<()> {
        let engine = Engine::MySql;
        let mut columns = vec![engine.quote_ident(key_column)];
        let mut values = vec![engine.quote_literal(key)];
        for (column, value) in assignments {
            columns.push(engine.quote_ident(column));
            values.push(engine.quote_value(value));
        }
        let updates = assignments
            .iter()
            .map(|(column, value)| {
                format!("{} = {}", engine.quote_ident(column), engine.quote_value(value))
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {updates}",
            engine.quote_ident(table),
            columns.join(", "),
            values.join(", "),
        );
        let conn = self.conn().await.map_err(|e| SyncError::load(table, e))?;
        conn.query_drop(sql)
            .await
            .map_err(|e| SyncError::load(table, e))
    }
}
