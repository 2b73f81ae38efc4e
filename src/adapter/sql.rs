//! Dialect-aware SQL rendering.
//!
//! All SQL strings handed to drivers and engine clients are built here, so
//! identifier and literal quoting stay in one audited place.

use super::{Engine, ExtractQuery, Filter, TimestampBound};
use crate::value::SqlValue;

impl Engine {
    /// Quote an identifier for this dialect.
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            Engine::MySql => format!("`{}`", ident.replace('`', "``")),
            Engine::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Quote a string literal for this dialect.
    pub fn quote_literal(&self, value: &str) -> String {
        match self {
            // MySQL treats backslash as an escape character inside literals.
            Engine::MySql => format!(
                "'{}'",
                value.replace('\\', "\\\\").replace('\'', "''")
            ),
            Engine::Postgres => format!("'{}'", value.replace('\'', "''")),
        }
    }

    pub fn quote_value(&self, value: &SqlValue) -> String {
        match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Int(n) => n.to_string(),
            SqlValue::Float(f) => f.to_string(),
            SqlValue::Text(s) => self.quote_literal(s),
        }
    }

    /// Render an epoch bound as a comparable expression. Millisecond
    /// columns hold bare integers; second-resolution columns hold
    /// engine-native timestamps.
    pub fn timestamp_expr(&self, bound: &TimestampBound) -> String {
        if bound.in_millis {
            bound.epoch.to_string()
        } else {
            match self {
                Engine::MySql => format!("FROM_UNIXTIME({})", bound.epoch),
                Engine::Postgres => format!("to_timestamp({})", bound.epoch),
            }
        }
    }

    pub fn render_bound(&self, bound: &TimestampBound) -> String {
        let op = if bound.inclusive { ">=" } else { ">" };
        format!(
            "{} {op} {}",
            self.quote_ident(&bound.column),
            self.timestamp_expr(bound)
        )
    }

    /// WHERE clause body, or `None` for an unfiltered query.
    pub fn render_filter(&self, filter: &Filter) -> Option<String> {
        match filter {
            Filter::All => None,
            Filter::Bounds(bounds) => Some(
                bounds
                    .iter()
                    .map(|b| self.render_bound(b))
                    .collect::<Vec<_>>()
                    .join(" AND "),
            ),
        }
    }

    pub fn render_select(&self, query: &ExtractQuery) -> String {
        let columns = query
            .columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!("SELECT {columns} FROM {}", self.quote_ident(&query.table));
        if let Some(clause) = self.render_filter(&query.filter) {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
        sql
    }

    pub fn render_delete(&self, table: &str, filter: &Filter) -> String {
        let mut sql = format!("DELETE FROM {}", self.quote_ident(table));
        if let Some(clause) = self.render_filter(filter) {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
        sql
    }

    /// MAX of a timestamp column converted to source-unit epoch.
    pub fn render_max_timestamp(&self, table: &str, column: &str, in_millis: bool) -> String {
        let column = self.quote_ident(column);
        let table = self.quote_ident(table);
        if in_millis {
            format!("SELECT MAX({column}) FROM {table}")
        } else {
            match self {
                Engine::MySql => {
                    format!("SELECT CAST(UNIX_TIMESTAMP(MAX({column})) AS SIGNED) FROM {table}")
                }
                Engine::Postgres => format!(
                    "SELECT CAST(EXTRACT(EPOCH FROM MAX({column})) AS BIGINT) FROM {table}"
                ),
            }
        }
    }
}
