//! Load actions: the state machines that move one table's data.

pub mod batch;
pub mod incremental;
pub mod refresh;

pub use batch::{BatchLoadAction, BatchState};
pub use incremental::{IncrementalLoadAction, IncrementalOutcome};
pub use refresh::{RefreshOutcome, RefreshRecentAction};

use crate::adapter::{ColumnInfo, DatabaseAdapter};
use crate::error::{Result, SyncError};
use crate::plan::{ColumnSelection, IndexSpec, TablePlan};
use std::collections::BTreeMap;
use tracing::debug;

/// Lookback subtracted from `last_row_at` to tolerate clock skew between
/// source and sync host.
pub const DEFAULT_OVERLAP_SECS: i64 = 60;

/// Safety margin behind `now` at which full-copy extracts begin, allowing
/// in-flight source transactions to commit before being read.
pub const DEFAULT_MAX_LAG_SECS: i64 = 30;

/// Refresh-recent window: one week.
pub const DEFAULT_REFRESH_WINDOW_SECS: i64 = 7 * 24 * 3600;

/// Batch catch-up stops after this many rounds even under sustained source
/// write pressure.
pub const CATCH_UP_MAX_ROUNDS: usize = 10;

/// Batch catch-up stops once a round extracts fewer rows than this.
pub const CATCH_UP_ROW_FLOOR: u64 = 1000;

/// Tuning knobs shared by all actions.
#[derive(Debug, Clone)]
pub struct ActionConfig {
    pub overlap_secs: i64,
    pub max_lag_secs: i64,
    pub refresh_window_secs: i64,
    pub chunk_size: usize,
    pub catch_up_max_rounds: usize,
    pub catch_up_row_floor: u64,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            overlap_secs: DEFAULT_OVERLAP_SECS,
            max_lag_secs: DEFAULT_MAX_LAG_SECS,
            refresh_window_secs: DEFAULT_REFRESH_WINDOW_SECS,
            chunk_size: 0,
            catch_up_max_rounds: CATCH_UP_MAX_ROUNDS,
            catch_up_row_floor: CATCH_UP_ROW_FLOOR,
        }
    }
}

impl ActionConfig {
    /// Overlap in the unit a plan's timestamp column uses.
    pub fn overlap_in(&self, in_millis: bool) -> i64 {
        if in_millis {
            self.overlap_secs * 1000
        } else {
            self.overlap_secs
        }
    }
}

/// A plan's projection materialized against the current source schema.
#[derive(Debug, Clone)]
pub struct Projection {
    pub columns: Vec<String>,
    pub column_infos: Vec<ColumnInfo>,
    pub primary_key: Vec<String>,
}

/// Resolve `columns = ALL` from the source schema and silently drop
/// projected columns the source no longer has. The timestamp column must
/// survive the resolution. A missing source table is schema drift and
/// surfaces as a load failure, with the missing relation as the cause.
pub(crate) async fn resolve_projection(
    source: &mut dyn DatabaseAdapter,
    plan: &TablePlan,
) -> Result<Projection> {
    let schema = source
        .schema(&plan.source_table)
        .await
        .map_err(|e| match e {
            SyncError::NoSuchTable(_) => SyncError::load(&plan.target_table, e),
            other => other,
        })?;

    let column_infos: Vec<ColumnInfo> = match &plan.columns {
        ColumnSelection::All => schema,
        ColumnSelection::Named(names) => {
            let mut infos = Vec::with_capacity(names.len());
            for name in names {
                match schema.iter().find(|c| &c.name == name) {
                    Some(info) => infos.push(info.clone()),
                    None => {
                        debug!(
                            table = %plan.source_table,
                            column = %name,
                            "projected column no longer on source, dropping"
                        );
                    }
                }
            }
            infos
        }
    };

    if !column_infos.iter().any(|c| c.name == plan.timestamp_column) {
        return Err(SyncError::load(
            &plan.target_table,
            anyhow::anyhow!(
                "timestamp column '{}' missing on source table '{}'",
                plan.timestamp_column,
                plan.source_table
            ),
        ));
    }

    let columns = column_infos.iter().map(|c| c.name.clone()).collect();
    let primary_key = column_infos
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| c.name.clone())
        .collect();

    Ok(Projection {
        columns,
        column_infos,
        primary_key,
    })
}

/// Declared indexes restricted to the resolved projection. An index
/// referencing a dropped column is dropped with it.
pub(crate) fn declared_indexes(
    plan: &TablePlan,
    projection: &Projection,
) -> BTreeMap<String, IndexSpec> {
    plan.indexes
        .iter()
        .filter(|(name, spec)| {
            let covered = spec
                .columns
                .iter()
                .all(|c| projection.columns.contains(c));
            if !covered {
                debug!(
                    table = %plan.target_table,
                    index = %name,
                    "index references a dropped column, skipping"
                );
            }
            covered
        })
        .map(|(name, spec)| (name.clone(), spec.clone()))
        .collect()
}
