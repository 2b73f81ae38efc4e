//! Incremental load: delta replication driven by `last_row_at`.
//!
//! Rows with timestamps inside the overlap window are re-fetched every
//! cycle; the bulk loader's duplicate-key tolerance makes that idempotent
//! on primary key, which is what gives at-least-once delivery across
//! restarts.

use super::{resolve_projection, ActionConfig};
use crate::adapter::{DatabaseAdapter, ExtractQuery, Filter};
use crate::clock::Clock;
use crate::error::Result;
use crate::pipeline::ExtractLoadPipeline;
use crate::plan::TablePlan;
use crate::registry::{MetadataUpdate, TableRegistry};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncrementalOutcome {
    /// The table has no baseline yet; a batch load has to run first.
    Skipped(&'static str),
    Synced {
        rows: u64,
        last_row_at: i64,
    },
}

pub struct IncrementalLoadAction<'a> {
    plan: &'a TablePlan,
    source: &'a mut dyn DatabaseAdapter,
    target: &'a mut dyn DatabaseAdapter,
    clock: &'a dyn Clock,
    config: &'a ActionConfig,
    pipeline: ExtractLoadPipeline,
}

impl<'a> IncrementalLoadAction<'a> {
    pub fn new(
        plan: &'a TablePlan,
        source: &'a mut dyn DatabaseAdapter,
        target: &'a mut dyn DatabaseAdapter,
        clock: &'a dyn Clock,
        config: &'a ActionConfig,
    ) -> Self {
        Self {
            plan,
            source,
            target,
            clock,
            config,
            pipeline: ExtractLoadPipeline::new(config.chunk_size),
        }
    }

    pub async fn run(mut self) -> Result<IncrementalOutcome> {
        let live = &self.plan.target_table;
        self.target.connection_reset().await?;

        if !self.target.table_exists(live).await? {
            warn!(table = %live, "incremental.skip: target table missing, batch load needed");
            return Ok(IncrementalOutcome::Skipped("target table missing"));
        }
        let last_row_at = match TableRegistry::get(self.target, live).await? {
            Some(meta) => match meta.last_row_at {
                Some(at) => at,
                None => {
                    warn!(table = %live, "incremental.skip: no last_row_at recorded");
                    return Ok(IncrementalOutcome::Skipped("no last_row_at recorded"));
                }
            },
            None => {
                warn!(table = %live, "incremental.skip: table not in registry");
                return Ok(IncrementalOutcome::Skipped("table not in registry"));
            }
        };

        let projection = resolve_projection(self.source, self.plan).await?;

        // The one target schema migration this engine performs: columns the
        // source gained are added to the live table before loading.
        let target_hash = self.target.hash_schema(live).await?;
        for info in &projection.column_infos {
            if !target_hash.contains_key(&info.name) {
                debug!(table = %live, column = %info.name, "adding missing target column");
                self.target
                    .add_column(live, &info.name, &info.sql_type)
                    .await?;
            }
        }

        let in_millis = self.plan.timestamp_in_millis;
        let lower = last_row_at - self.config.overlap_in(in_millis);
        let query = ExtractQuery {
            table: self.plan.source_table.clone(),
            columns: projection.columns.clone(),
            filter: Filter::newer_than(&self.plan.timestamp_column, lower, in_millis),
        };

        let rows = self
            .pipeline
            .run(
                self.source,
                self.target,
                &query,
                live,
                self.plan.charset.as_deref(),
            )
            .await?;

        let observed = self
            .target
            .max_timestamp(live, &self.plan.timestamp_column, in_millis)
            .await?;
        let new_last_row_at = observed.unwrap_or(last_row_at).max(last_row_at);

        TableRegistry::set(
            self.target,
            live,
            &MetadataUpdate {
                last_synced_at: Some(self.clock.now().timestamp()),
                last_row_at: Some(new_last_row_at),
                ..Default::default()
            },
        )
        .await?;

        info!(table = %live, rows, "incremental.load");
        Ok(IncrementalOutcome::Synced {
            rows,
            last_row_at: new_last_row_at,
        })
    }
}
