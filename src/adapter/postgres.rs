//! PostgreSQL adapter.
//!
//! Queries and introspection go through `tokio-postgres`; bulk extract and
//! load shell out to `psql` with `\copy`, text format, and the `NULL`
//! token shared with the MySQL side. Duplicate-key tolerance on load comes
//! from staging the file in a session temp table and inserting with
//! `ON CONFLICT DO NOTHING`.

use super::{
    no_such_table, run_client, ColumnInfo, DatabaseAdapter, Engine, ExtractQuery, Filter,
    typemap,
};
use crate::config::ConnectionOptions;
use crate::error::{Result, SyncError};
use crate::plan::IndexSpec;
use crate::value::SqlValue;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tokio::process::Command;
use tokio_postgres::types::Type;
use tokio_postgres::{Client, NoTls};
use tracing::debug;

pub struct PostgresAdapter {
    options: ConnectionOptions,
    client: Option<Client>,
}

impl PostgresAdapter {
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            client: None,
        }
    }

    async fn client(&mut self) -> anyhow::Result<&Client> {
        if self.client.is_none() {
            let mut config = tokio_postgres::Config::new();
            config
                .host(&self.options.host)
                .port(self.options.resolved_port())
                .user(&self.options.user)
                .password(&self.options.password)
                .dbname(&self.options.database);
            let (client, connection) = config.connect(NoTls).await?;
            // Drive the connection in the background, as tokio-postgres
            // requires.
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!("postgresql connection error: {e}");
                }
            });
            self.client = Some(client);
        }
        Ok(self.client.as_ref().expect("connection just established"))
    }

    fn client_command(&self) -> Command {
        let mut cmd = Command::new("psql");
        cmd.arg("--no-psqlrc")
            .arg("--quiet")
            .arg("--host")
            .arg(&self.options.host)
            .arg("--port")
            .arg(self.options.resolved_port().to_string())
            .arg("--username")
            .arg(&self.options.user)
            .arg("--dbname")
            .arg(&self.options.database)
            .arg("-v")
            .arg("ON_ERROR_STOP=1");
        cmd.env("PGPASSWORD", &self.options.password);
        cmd
    }

    fn row_value(row: &tokio_postgres::Row, idx: usize) -> SqlValue {
        match *row.columns()[idx].type_() {
            Type::INT2 => row
                .get::<_, Option<i16>>(idx)
                .map_or(SqlValue::Null, |n| SqlValue::Int(n as i64)),
            Type::INT4 => row
                .get::<_, Option<i32>>(idx)
                .map_or(SqlValue::Null, |n| SqlValue::Int(n as i64)),
            Type::INT8 => row
                .get::<_, Option<i64>>(idx)
                .map_or(SqlValue::Null, SqlValue::Int),
            Type::FLOAT4 => row
                .get::<_, Option<f32>>(idx)
                .map_or(SqlValue::Null, |f| SqlValue::Float(f as f64)),
            Type::FLOAT8 => row
                .get::<_, Option<f64>>(idx)
                .map_or(SqlValue::Null, SqlValue::Float),
            _ => row
                .get::<_, Option<String>>(idx)
                .map_or(SqlValue::Null, SqlValue::Text),
        }
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    async fn connection_reset(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        let database = self.options.database.clone();
        let client = self
            .client()
            .await
            .map_err(|e| SyncError::extract(&database, e))?;
        let rows = client
            .query(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
                &[],
            )
            .await
            .map_err(|e| SyncError::extract(&database, e))?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        let client = self.client().await.map_err(|e| SyncError::extract(table, e))?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_name = $1",
                &[&table],
            )
            .await
            .map_err(|e| SyncError::extract(table, e))?;
        let count: i64 = row.get(0);
        Ok(count > 0)
    }

    async fn schema(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        let client = self.client().await.map_err(|e| SyncError::extract(table, e))?;
        let rows = client
            .query(
                "SELECT column_name, data_type, character_maximum_length, \
                        numeric_precision, numeric_scale, is_nullable, column_default \
                 FROM information_schema.columns \
                 WHERE table_schema = 'public' AND table_name = $1 \
                 ORDER BY ordinal_position",
                &[&table],
            )
            .await
            .map_err(|e| SyncError::extract(table, e))?;

        if rows.is_empty() {
            return Err(no_such_table(table));
        }

        let pk_rows = client
            .query(
                "SELECT kcu.column_name \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON tc.constraint_name = kcu.constraint_name \
                  AND tc.table_schema = kcu.table_schema \
                 WHERE tc.constraint_type = 'PRIMARY KEY' \
                   AND tc.table_schema = 'public' AND tc.table_name = $1",
                &[&table],
            )
            .await
            .map_err(|e| SyncError::extract(table, e))?;
        let pk_columns: Vec<String> = pk_rows.iter().map(|r| r.get(0)).collect();

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get(0);
            let data_type: String = row.get(1);
            let char_len: Option<i32> = row.get(2);
            let precision: Option<i32> = row.get(3);
            let scale: Option<i32> = row.get(4);
            let nullable: String = row.get(5);
            let default: Option<String> = row.get(6);

            let sql_type = match (data_type.as_str(), char_len, precision, scale) {
                ("character varying" | "character", Some(len), _, _) => {
                    format!("{data_type}({len})")
                }
                ("numeric", _, Some(p), Some(s)) => format!("numeric({p},{s})"),
                _ => data_type.clone(),
            };

            columns.push(ColumnInfo {
                primary_key: pk_columns.contains(&name),
                nullable: nullable == "YES",
                name,
                sql_type,
                default,
            });
        }
        Ok(columns)
    }

    async fn indexes(&mut self, table: &str) -> Result<BTreeMap<String, IndexSpec>> {
        let client = self.client().await.map_err(|e| SyncError::extract(table, e))?;
        let rows = client
            .query(
                "SELECT i.relname, a.attname, ix.indisunique \
                 FROM pg_class t \
                 JOIN pg_index ix ON t.oid = ix.indrelid \
                 JOIN pg_class i ON i.oid = ix.indexrelid \
                 JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey) \
                 WHERE t.relname = $1 AND t.relkind = 'r' AND NOT ix.indisprimary \
                 ORDER BY i.relname, array_position(ix.indkey, a.attnum)",
                &[&table],
            )
            .await
            .map_err(|e| SyncError::extract(table, e))?;

        let mut indexes: BTreeMap<String, IndexSpec> = BTreeMap::new();
        for row in rows {
            let name: String = row.get(0);
            let column: String = row.get(1);
            let unique: bool = row.get(2);
            let entry = indexes.entry(name).or_insert_with(|| IndexSpec {
                columns: Vec::new(),
                unique,
            });
            entry.columns.push(column);
        }
        Ok(indexes)
    }

    async fn extract_to_file(
        &mut self,
        query: &ExtractQuery,
        file: &Path,
        _charset: Option<&str>,
    ) -> Result<()> {
        let select = Engine::Postgres.render_select(query);
        debug!(table = %query.table, "postgresql extract: {select}");
        let copy = format!(
            "\\copy ({select}) TO '{}' WITH (FORMAT text, NULL 'NULL')",
            file.display()
        );
        let mut cmd = self.client_command();
        cmd.arg("-c").arg("SET TIME ZONE 'UTC'").arg("-c").arg(copy);
        run_client(cmd, None)
            .await
            .map_err(|e| SyncError::extract(&query.table, e))
    }

    async fn load_from_file(
        &mut self,
        table: &str,
        columns: &[String],
        file: &Path,
    ) -> Result<()> {
        let engine = Engine::Postgres;
        let cols = columns
            .iter()
            .map(|c| engine.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        // One psql session: the temp table lives across the -c commands
        // and vanishes when the client exits.
        let create_tmp = format!(
            "CREATE TEMP TABLE bulk_load (LIKE {} INCLUDING DEFAULTS)",
            engine.quote_ident(table)
        );
        let copy = format!(
            "\\copy bulk_load ({cols}) FROM '{}' WITH (FORMAT text, NULL 'NULL')",
            file.display()
        );
        let insert = format!(
            "INSERT INTO {} ({cols}) SELECT {cols} FROM bulk_load ON CONFLICT DO NOTHING",
            engine.quote_ident(table)
        );
        debug!(table, "postgresql load via temp table");
        let mut cmd = self.client_command();
        cmd.arg("-c")
            .arg("SET TIME ZONE 'UTC'")
            .arg("-c")
            .arg(create_tmp)
            .arg("-c")
            .arg(copy)
            .arg("-c")
            .arg(insert);
        run_client(cmd, None)
            .await
            .map_err(|e| SyncError::load(table, e))
    }

    async fn create_table(
        &mut self,
        name: &str,
        columns: &[ColumnInfo],
        _charset: Option<&str>,
    ) -> Result<()> {
        let engine = Engine::Postgres;
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
        let sql = format!("CREATE TABLE {} ({})", engine.quote_ident(name), defs.join(", "));
        let client = self.client().await.map_err(|e| SyncError::load(name, e))?;
        client
            .batch_execute(&sql)
            .await
            .map_err(|e| SyncError::load(name, e))
    }

    async fn create_table_like(&mut self, new: &str, existing: &str) -> Result<()> {
        let sql = format!(
            "CREATE TABLE {} (LIKE {} INCLUDING ALL)",
            Engine::Postgres.quote_ident(new),
            Engine::Postgres.quote_ident(existing)
        );
        let client = self.client().await.map_err(|e| SyncError::load(new, e))?;
        client
            .batch_execute(&sql)
            .await
            .map_err(|e| SyncError::load(new, e))
    }

    async fn drop_table_if_exists(&mut self, name: &str) -> Result<()> {
        let sql = format!(
            "DROP TABLE IF EXISTS {}",
            Engine::Postgres.quote_ident(name)
        );
        let client = self.client().await.map_err(|e| SyncError::load(name, e))?;
        client
            .batch_execute(&sql)
            .await
            .map_err(|e| SyncError::load(name, e))
    }

    async fn switch_table(&mut self, staging: &str, live: &str) -> Result<()> {
        let engine = Engine::Postgres;
        if self.table_exists(live).await? {
            let retired = format!("old_{live}_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
            let swap = format!(
                "BEGIN; ALTER TABLE {live} RENAME TO {retired}; \
                 ALTER TABLE {staging} RENAME TO {live}; COMMIT",
                live = engine.quote_ident(live),
                retired = engine.quote_ident(&retired),
                staging = engine.quote_ident(staging),
            );
            let client = self.client().await.map_err(|e| SyncError::load(live, e))?;
            client
                .batch_execute(&swap)
                .await
                .map_err(|e| SyncError::load(live, e))?;
            self.drop_table_if_exists(&retired).await
        } else {
            let sql = format!(
                "ALTER TABLE {} RENAME TO {}",
                engine.quote_ident(staging),
                engine.quote_ident(live)
            );
            let client = self.client().await.map_err(|e| SyncError::load(live, e))?;
            client
                .batch_execute(&sql)
                .await
                .map_err(|e| SyncError::load(live, e))
        }
    }

    async fn add_column(&mut self, table: &str, column: &str, sql_type: &str) -> Result<()> {
        let engine = Engine::Postgres;
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            engine.quote_ident(table),
            engine.quote_ident(column),
            typemap::render_type(engine, sql_type)
        );
        let client = self.client().await.map_err(|e| SyncError::load(table, e))?;
        client
            .batch_execute(&sql)
            .await
            .map_err(|e| SyncError::load(table, e))
    }

    async fn add_index(&mut self, table: &str, name: &str, spec: &IndexSpec) -> Result<()> {
        let engine = Engine::Postgres;
        // Index names are schema-global here, and the live table still owns
        // the previous generation's names until it is dropped; a random
        // suffix keeps generations apart. remove_indexes_except matches on
        // the declared prefix.
        let physical = format!(
            "{name}_{}",
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let unique = if spec.unique { "UNIQUE " } else { "" };
        let columns = spec
            .columns
            .iter()
            .map(|c| engine.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "CREATE {unique}INDEX {} ON {} ({columns})",
            engine.quote_ident(&physical),
            engine.quote_ident(table),
        );
        let client = self.client().await.map_err(|e| SyncError::load(table, e))?;
        client
            .batch_execute(&sql)
            .await
            .map_err(|e| SyncError::load(table, e))
    }

    async fn remove_indexes_except(
        &mut self,
        table: &str,
        keep: &BTreeSet<String>,
    ) -> Result<()> {
        let existing = self.indexes(table).await?;
        for name in existing.keys() {
            let kept = keep
                .iter()
                .any(|k| name == k || name.starts_with(&format!("{k}_")));
            if kept {
                continue;
            }
            let sql = format!("DROP INDEX {}", Engine::Postgres.quote_ident(name));
            let client = self.client().await.map_err(|e| SyncError::load(table, e))?;
            client
                .batch_execute(&sql)
                .await
                .map_err(|e| SyncError::load(table, e))?;
        }
        Ok(())
    }

    async fn delete_where(&mut self, table: &str, filter: &Filter) -> Result<u64> {
        let sql = Engine::Postgres.render_delete(table, filter);
        let client = self.client().await.map_err(|e| SyncError::load(table, e))?;
        client
            .execute(&sql, &[])
            .await
            .map_err(|e| SyncError::load(table, e))
    }

    async fn max_timestamp(
        &mut self,
        table: &str,
        column: &str,
        in_millis: bool,
    ) -> Result<Option<i64>> {
        let sql = Engine::Postgres.render_max_timestamp(table, column, in_millis);
        let client = self.client().await.map_err(|e| SyncError::extract(table, e))?;
        let row = client
            .query_one(&sql, &[])
            .await
            .map_err(|e| SyncError::extract(table, e))?;
        Ok(row.get::<_, Option<i64>>(0))
    }

    async fn select_row(
        &mut self,
        table: &str,
        key_column: &str,
        key: &str,
        columns: &[&str],
    ) -> Result<Option<Vec<SqlValue>>> {
        let engine = Engine::Postgres;
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
        let client = self.client().await.map_err(|e| SyncError::load(table, e))?;
        let rows = client
            .query(&sql, &[])
            .await
            .map_err(|e| SyncError::load(table, e))?;
        Ok(rows
            .first()
            .map(|row| (0..columns.len()).map(|i| Self::row_value(row, i)).collect()))
    }

    async fn select_all(&mut self, table: &str, columns: &[&str]) -> Result<Vec<Vec<SqlValue>>> {
        let engine = Engine::Postgres;
        let cols = columns
            .iter()
            .map(|c| engine.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {cols} FROM {}", engine.quote_ident(table));
        let client = self.client().await.map_err(|e| SyncError::load(table, e))?;
        let rows = client
            .query(&sql, &[])
            .await
            .map_err(|e| SyncError::load(table, e))?;
        Ok(rows
            .iter()
            .map(|row| (0..columns.len()).map(|i| Self::row_value(row, i)).collect())
            .collect())
    }

    async fn delete_row(&mut self, table: &str, key_column: &str, key: &str) -> Result<()> {
        let engine = Engine::Postgres;
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            engine.quote_ident(table),
            engine.quote_ident(key_column),
            engine.quote_literal(key)
        );
        let client = self.client().await.map_err(|e| SyncError::load(table, e))?;
        client
            .batch_execute(&sql)
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
        let engine = Engine::Postgres;
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
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {updates}",
            engine.quote_ident(table),
            columns.join(", "),
            values.join(", "),
            engine.quote_ident(key_column),
        );
        let client = self.client().await.map_err(|e| SyncError::load(table, e))?;
        client
            .batch_execute(&sql)
            .await
            .map_err(|e| SyncError::load(table, e))
    }
}
