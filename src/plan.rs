//! Table plans: the declarative description of what to copy and how.
//!
//! A [`TablePlan`] is immutable for the duration of one sync cycle. Plans
//! come from a [`PlanProvider`]: either a static list out of the
//! configuration file, or one plan per user table enumerated from the
//! source schema.

use crate::adapter::DatabaseAdapter;
use crate::error::{Result, SyncError};
use crate::registry::REGISTRY_TABLE;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

pub const DEFAULT_TIMESTAMP_COLUMN: &str = "updated_at";

/// Prefix for transient staging tables built during batch loads.
pub const STAGING_PREFIX: &str = "new_";

/// The projected column set: everything the source table has, or an
/// explicit ordered list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSelection {
    All,
    Named(Vec<String>),
}

impl Serialize for ColumnSelection {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ColumnSelection::All => serializer.serialize_str("ALL"),
            ColumnSelection::Named(columns) => columns.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ColumnSelection {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Sentinel(String),
            List(Vec<String>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Sentinel(s) if s == "ALL" => Ok(ColumnSelection::All),
            Repr::Sentinel(s) => Err(serde::de::Error::custom(format!(
                "columns must be the sentinel \"ALL\" or a list, got \"{s}\""
            ))),
            Repr::List(columns) => Ok(ColumnSelection::Named(columns)),
        }
    }
}

/// Refresh-recent mode for a plan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RefreshRecent {
    #[default]
    Disabled,
    /// Window filtered on the plan's timestamp column.
    ByTimestamp,
    /// Window filtered on the timestamp column plus this column.
    ByColumn(String),
}

impl Serialize for RefreshRecent {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            RefreshRecent::Disabled => serializer.serialize_str("disabled"),
            RefreshRecent::ByTimestamp => serializer.serialize_str("by-timestamp"),
            RefreshRecent::ByColumn(c) => serializer.serialize_str(c),
        }
    }
}

impl<'de> Deserialize<'de> for RefreshRecent {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "disabled" => RefreshRecent::Disabled,
            "by-timestamp" | "enabled-by-timestamp" => RefreshRecent::ByTimestamp,
            column => RefreshRecent::ByColumn(column.to_string()),
        })
    }
}

/// Declared secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

/// Declarative description of one table's replication requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TablePlan {
    pub target_table: String,
    pub source_table: String,
    pub source_id: String,

    #[serde(default = "default_columns")]
    pub columns: ColumnSelection,

    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,

    #[serde(default)]
    pub timestamp_in_millis: bool,

    #[serde(default)]
    pub indexes: BTreeMap<String, IndexSpec>,

    #[serde(default)]
    pub refresh_recent: RefreshRecent,

    #[serde(default)]
    pub charset: Option<String>,
}

fn default_columns() -> ColumnSelection {
    ColumnSelection::All
}

fn default_timestamp_column() -> String {
    DEFAULT_TIMESTAMP_COLUMN.to_string()
}

impl TablePlan {
    /// A minimal plan copying every column of `source_table`.
    pub fn new(
        source_id: impl Into<String>,
        source_table: impl Into<String>,
        target_table: impl Into<String>,
    ) -> Self {
        Self {
            target_table: target_table.into(),
            source_table: source_table.into(),
            source_id: source_id.into(),
            columns: ColumnSelection::All,
            timestamp_column: default_timestamp_column(),
            timestamp_in_millis: false,
            indexes: BTreeMap::new(),
            refresh_recent: RefreshRecent::Disabled,
            charset: None,
        }
    }

    /// Name of the transient staging table owned by a batch load of this
    /// plan.
    pub fn staging_table(&self) -> String {
        format!("{STAGING_PREFIX}{}", self.target_table)
    }

    /// Startup validation. The timestamp column must be part of an explicit
    /// projection; an `ALL` projection is materialized from the source
    /// schema before any query is issued, so it is checked at that point.
    pub fn validate(&self) -> Result<()> {
        if self.target_table.is_empty() || self.source_table.is_empty() {
            return Err(SyncError::config(format!(
                "plan for source '{}' has an empty table name",
                self.source_id
            )));
        }
        if let ColumnSelection::Named(columns) = &self.columns {
            if columns.is_empty() {
                return Err(SyncError::config(format!(
                    "plan '{}' projects no columns",
                    self.target_table
                )));
            }
            if !columns.contains(&self.timestamp_column) {
                return Err(SyncError::config(format!(
                    "plan '{}' does not project its timestamp column '{}'",
                    self.target_table, self.timestamp_column
                )));
            }
        }
        if self.target_table.starts_with(STAGING_PREFIX) {
            return Err(SyncError::config(format!(
                "target table '{}' collides with the staging namespace",
                self.target_table
            )));
        }
        Ok(())
    }
}

/// Produces the current list of plans for one source.
#[async_trait]
pub trait PlanProvider: Send + Sync {
    async fn plans(&self, source: &mut dyn DatabaseAdapter) -> Result<Vec<TablePlan>>;
}

/// Fixed plan list from configuration.
pub struct StaticPlans {
    plans: Vec<TablePlan>,
}

impl StaticPlans {
    pub fn new(plans: Vec<TablePlan>) -> Self {
        Self { plans }
    }
}

#[async_trait]
impl PlanProvider for StaticPlans {
    async fn plans(&self, _source: &mut dyn DatabaseAdapter) -> Result<Vec<TablePlan>> {
        Ok(self.plans.clone())
    }
}

/// One plan per user table on the source, target table named like the
/// source table. The registry table and leftover staging tables are never
/// replicated.
pub struct AllTables {
    source_id: String,
    timestamp_column: String,
    timestamp_in_millis: bool,
}

impl AllTables {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            timestamp_column: default_timestamp_column(),
            timestamp_in_millis: false,
        }
    }
}

#[async_trait]
impl PlanProvider for AllTables {
    async fn plans(&self, source: &mut dyn DatabaseAdapter) -> Result<Vec<TablePlan>> {
        let tables = source.list_tables().await?;
        let plans = tables
            .into_iter()
            .filter(|t| t != REGISTRY_TABLE && !t.starts_with(STAGING_PREFIX))
            .map(|t| {
                let mut plan = TablePlan::new(&self.source_id, &t, &t);
                plan.timestamp_column = self.timestamp_column.clone();
                plan.timestamp_in_millis = self.timestamp_in_millis;
                plan
            })
            .collect();
        Ok(plans)
    }
}
