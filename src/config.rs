//! YAML configuration: source and target connections, plans, and engine
//! tuning knobs.
//!
//! Everything here is validated at startup; a bad plan or connection block
//! is a [`SyncError::Config`] before any connection is opened.

use crate::actions::ActionConfig;
use crate::adapter::Engine;
use crate::error::{Result, SyncError};
use crate::plan::{AllTables, PlanProvider, StaticPlans, TablePlan};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Connection options for one database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionOptions {
    pub engine: Engine,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    #[serde(default)]
    pub charset: Option<String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

impl ConnectionOptions {
    pub fn resolved_port(&self) -> u16 {
        self.port.unwrap_or(match self.engine {
            Engine::MySql => 3306,
            Engine::Postgres => 5432,
        })
    }
}

/// Plans are either an ordered list of literals or a provider reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlansConfig {
    AllTables { all_tables: String },
    Static(Vec<TablePlan>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub sources: BTreeMap<String, ConnectionOptions>,
    pub target: ConnectionOptions,
    pub plans: PlansConfig,

    /// Lookback subtracted from `last_row_at`, e.g. "60s".
    #[serde(default)]
    pub overlap: Option<String>,
    /// Full-copy safety margin behind now, e.g. "30s".
    #[serde(default)]
    pub max_lag: Option<String>,
    /// Refresh-recent window, e.g. "1w" written as "168h".
    #[serde(default)]
    pub refresh_window: Option<String>,
    /// Sleep between incremental iterations, e.g. "1s".
    #[serde(default)]
    pub cadence: Option<String>,
    /// Maximum lines per bulk-load chunk; 0 loads extracts whole.
    #[serde(default)]
    pub chunk_size: Option<usize>,
    /// Same-table failures in a row before the incremental loop escapes.
    #[serde(default)]
    pub max_consecutive_failures: Option<u32>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SyncError::config(format!(
                "failed to read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)
            .map_err(|e| SyncError::config(format!("failed to parse configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(SyncError::config("no sources configured"));
        }

        match &self.plans {
            PlansConfig::AllTables { all_tables } => {
                if !self.sources.contains_key(all_tables) {
                    return Err(SyncError::config(format!(
                        "all_tables references unknown source '{all_tables}'"
                    )));
                }
            }
            PlansConfig::Static(plans) => {
                if plans.is_empty() {
                    return Err(SyncError::config("plan list is empty"));
                }
                let mut seen = std::collections::BTreeSet::new();
                for plan in plans {
                    plan.validate()?;
                    if !self.sources.contains_key(&plan.source_id) {
                        return Err(SyncError::config(format!(
                            "plan '{}' references unknown source '{}'",
                            plan.target_table, plan.source_id
                        )));
                    }
                    if !seen.insert(plan.target_table.clone()) {
                        return Err(SyncError::config(format!(
                            "duplicate target table '{}'",
                            plan.target_table
                        )));
                    }
                }
            }
        }

        // Durations must parse even when the knobs go unused this run.
        self.action_config()?;
        self.cadence_duration()?;
        Ok(())
    }

    /// One provider per source that has plans, in configuration order.
    pub fn providers(&self) -> Result<Vec<(String, Arc<dyn PlanProvider>)>> {
        match &self.plans {
            PlansConfig::AllTables { all_tables } => Ok(vec![(
                all_tables.clone(),
                Arc::new(AllTables::new(all_tables)) as Arc<dyn PlanProvider>,
            )]),
            PlansConfig::Static(plans) => {
                let mut order: Vec<String> = Vec::new();
                let mut by_source: BTreeMap<String, Vec<TablePlan>> = BTreeMap::new();
                for plan in plans {
                    if !by_source.contains_key(&plan.source_id) {
                        order.push(plan.source_id.clone());
                    }
                    by_source
                        .entry(plan.source_id.clone())
                        .or_default()
                        .push(plan.clone());
                }
                Ok(order
                    .into_iter()
                    .map(|source_id| {
                        let plans = by_source.remove(&source_id).unwrap_or_default();
                        (
                            source_id,
                            Arc::new(StaticPlans::new(plans)) as Arc<dyn PlanProvider>,
                        )
                    })
                    .collect())
            }
        }
    }

    pub fn action_config(&self) -> Result<ActionConfig> {
        let mut config = ActionConfig::default();
        if let Some(s) = &self.overlap {
            config.overlap_secs = parse_duration_secs(s)?;
        }
        if let Some(s) = &self.max_lag {
            config.max_lag_secs = parse_duration_secs(s)?;
        }
        if let Some(s) = &self.refresh_window {
            config.refresh_window_secs = parse_duration_secs(s)?;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        Ok(config)
    }

    pub fn cadence_duration(&self) -> Result<std::time::Duration> {
        let secs = match &self.cadence {
            Some(s) => parse_duration_secs(s)?,
            None => 1,
        };
        Ok(std::time::Duration::from_secs(secs.max(0) as u64))
    }

    pub fn max_consecutive_failures(&self) -> u32 {
        self.max_consecutive_failures.unwrap_or(3).max(1)
    }
}

/// Parse a duration string like "1h", "30m", "300s", "300" into seconds.
pub fn parse_duration_secs(s: &str) -> Result<i64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(SyncError::config("empty duration string"));
    }

    let parse = |num: &str, unit: i64| -> Result<i64> {
        num.parse::<i64>()
            .map(|n| n * unit)
            .map_err(|_| SyncError::config(format!("invalid duration value: {s}")))
    };

    if let Some(num) = s.strip_suffix('h') {
        return parse(num, 3600);
    }
    if let Some(num) = s.strip_suffix('m') {
        return parse(num, 60);
    }
    if let Some(num) = s.strip_suffix('s') {
        return parse(num, 1);
    }
    parse(s, 1)
}
