//! Batch load: full copy into a staging table, post-load catch-up, atomic
//! swap.
//!
//! The staging table `new_<target>` is owned exclusively by this action.
//! Any error before the swap drops it and leaves the live table and the
//! registry untouched; after the swap the action is committed even if the
//! registry bookkeeping needs retries.

use super::{declared_indexes, resolve_projection, ActionConfig, Projection};
use crate::adapter::{DatabaseAdapter, ExtractQuery, Filter};
use crate::clock::{epoch_in, Clock};
use crate::error::Result;
use crate::pipeline::ExtractLoadPipeline;
use crate::plan::TablePlan;
use crate::registry::{MetadataUpdate, TableRegistry};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

const REGISTRY_UPDATE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Prepared,
    Loaded,
    CaughtUp,
    Committed,
    Done,
}

pub struct BatchLoadAction<'a> {
    plan: &'a TablePlan,
    source: &'a mut dyn DatabaseAdapter,
    target: &'a mut dyn DatabaseAdapter,
    clock: &'a dyn Clock,
    config: &'a ActionConfig,
    pipeline: ExtractLoadPipeline,
    state: BatchState,
    projection: Option<Projection>,
    batch_start: Option<DateTime<Utc>>,
    extract_upper_bound: Option<i64>,
    last_row_at: Option<i64>,
}

impl<'a> BatchLoadAction<'a> {
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
            state: BatchState::Idle,
            projection: None,
            batch_start: None,
            extract_upper_bound: None,
            last_row_at: None,
        }
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Drive the full state machine, cleaning up the staging table on any
    /// pre-commit failure.
    pub async fn run(mut self) -> Result<()> {
        match self.drive().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort().await;
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        self.prepare().await?;
        self.extract_and_load().await?;
        self.post_load().await?;
        self.commit().await
    }

    /// Reset the target connection, clear any leftover staging table from a
    /// crashed run, and build a fresh one with the resolved projection and
    /// plan charset. Unique indexes go on now so the bulk loader can drop
    /// duplicate keys during the load; non-unique indexes wait until
    /// commit.
    pub async fn prepare(&mut self) -> Result<()> {
        let staging = self.plan.staging_table();
        self.target.connection_reset().await?;

        // A missing source table fails here, before any staging DDL.
        let projection = resolve_projection(self.source, self.plan).await?;
        if projection.primary_key.is_empty() {
            warn!(
                table = %self.plan.target_table,
                "source has no primary key, duplicate rows will not be deduplicated"
            );
        }

        self.target.drop_table_if_exists(&staging).await?;

        let live_compatible = self.live_table_reusable(&projection).await?;
        if live_compatible {
            self.target
                .create_table_like(&staging, &self.plan.target_table)
                .await?;
            // The copy inherits the live table's secondary indexes; strip
            // them all and re-add only the declared unique ones.
            self.target
                .remove_indexes_except(&staging, &BTreeSet::new())
                .await?;
            let staged = self.target.hash_schema(&staging).await?;
            for info in &projection.column_infos {
                if !staged.contains_key(&info.name) {
                    self.target
                        .add_column(&staging, &info.name, &info.sql_type)
                        .await?;
                }
            }
        } else {
            self.target
                .create_table(
                    &staging,
                    &projection.column_infos,
                    self.plan.charset.as_deref(),
                )
                .await?;
        }

        for (name, spec) in declared_indexes(self.plan, &projection) {
            if spec.unique {
                self.target.add_index(&staging, &name, &spec).await?;
            }
        }

        self.projection = Some(projection);
        self.state = BatchState::Prepared;
        debug!(table = %self.plan.target_table, "batch.prepare");
        Ok(())
    }

    /// Whether the live table exists and its column types still agree with
    /// the source, so the staging table can be cloned from it instead of
    /// re-derived through the type map.
    async fn live_table_reusable(&mut self, projection: &Projection) -> Result<bool> {
        if !self.target.table_exists(&self.plan.target_table).await? {
            return Ok(false);
        }
        let source_hash = self.source.hash_schema(&self.plan.source_table).await?;
        let target_hash = self.target.hash_schema(&self.plan.target_table).await?;
        Ok(projection.columns.iter().all(|column| {
            match (source_hash.get(column), target_hash.get(column)) {
                (Some(s), Some(t)) => s == t,
                // Missing on target is fine; prepare adds the column.
                (Some(_), None) => true,
                _ => false,
            }
        }))
    }

    /// Full-copy extract into the staging table. No lower bound and no
    /// upper bound filter either; the recorded `extract_upper_bound`
    /// (`now - max_lag`) only seeds `last_row_at` when the copy came back
    /// empty.
    pub async fn extract_and_load(&mut self) -> Result<u64> {
        let projection = self.projection.as_ref().expect("prepare ran first");
        let batch_start = self.clock.now();
        self.batch_start = Some(batch_start);
        self.extract_upper_bound = Some(epoch_in(
            batch_start - Duration::seconds(self.config.max_lag_secs),
            self.plan.timestamp_in_millis,
        ));

        let query = ExtractQuery {
            table: self.plan.source_table.clone(),
            columns: projection.columns.clone(),
            filter: Filter::All,
        };
        let staging = self.plan.staging_table();
        let rows = self
            .pipeline
            .run(
                self.source,
                self.target,
                &query,
                &staging,
                self.plan.charset.as_deref(),
            )
            .await?;

        let observed = self
            .target
            .max_timestamp(
                &staging,
                &self.plan.timestamp_column,
                self.plan.timestamp_in_millis,
            )
            .await?;
        self.last_row_at = observed.or(self.extract_upper_bound);

        self.state = BatchState::Loaded;
        info!(table = %self.plan.target_table, rows, "batch.load");
        Ok(rows)
    }

    /// Catch up on rows written while the full copy was running:
    /// repeatedly pull everything newer than `last_row_at - overlap` until
    /// a round comes back small or the round cap is hit.
    pub async fn post_load(&mut self) -> Result<()> {
        let projection = self.projection.as_ref().expect("prepare ran first").clone();
        let staging = self.plan.staging_table();
        let in_millis = self.plan.timestamp_in_millis;
        let overlap = self.config.overlap_in(in_millis);

        for round in 0..self.config.catch_up_max_rounds {
            let lower = self
                .last_row_at
                .expect("extract set a lower bound")
                - overlap;
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
                    &staging,
                    self.plan.charset.as_deref(),
                )
                .await?;
            debug!(table = %self.plan.target_table, round, rows, "batch.catch_up");

            if let Some(observed) = self
                .target
                .max_timestamp(&staging, &self.plan.timestamp_column, in_millis)
                .await?
            {
                self.last_row_at = Some(self.last_row_at.unwrap_or(observed).max(observed));
            }

            if rows < self.config.catch_up_row_floor {
                break;
            }
        }

        self.state = BatchState::CaughtUp;
        Ok(())
    }

    /// Add the remaining declared indexes, swap the staging table live, and
    /// record the sync in the registry. A registry failure after the swap
    /// does not un-commit; the update is idempotent and retried.
    pub async fn commit(&mut self) -> Result<()> {
        let projection = self.projection.as_ref().expect("prepare ran first").clone();
        let staging = self.plan.staging_table();

        for (name, spec) in declared_indexes(self.plan, &projection) {
            if !spec.unique {
                self.target.add_index(&staging, &name, &spec).await?;
            }
        }

        self.target
            .switch_table(&staging, &self.plan.target_table)
            .await?;
        self.state = BatchState::Committed;
        info!(table = %self.plan.target_table, "batch.switch");

        let live_max = self
            .target
            .max_timestamp(
                &self.plan.target_table,
                &self.plan.timestamp_column,
                self.plan.timestamp_in_millis,
            )
            .await
            .ok()
            .flatten();
        let update = MetadataUpdate {
            last_synced_at: Some(self.clock.now().timestamp()),
            last_batch_synced_at: self.batch_start.map(|t| t.timestamp()),
            last_row_at: live_max.or(self.last_row_at),
        };

        for attempt in 1..=REGISTRY_UPDATE_ATTEMPTS {
            match TableRegistry::set(self.target, &self.plan.target_table, &update).await {
                Ok(()) => break,
                Err(e) if attempt < REGISTRY_UPDATE_ATTEMPTS => {
                    warn!(
                        table = %self.plan.target_table,
                        attempt,
                        "registry update failed after commit, retrying: {e}"
                    );
                }
                Err(e) => {
                    // The swap already happened; the next sync repairs the
                    // registry row.
                    warn!(
                        table = %self.plan.target_table,
                        "registry update abandoned after commit: {e}"
                    );
                }
            }
        }

        self.state = BatchState::Done;
        Ok(())
    }

    async fn abort(&mut self) {
        if self.state == BatchState::Committed || self.state == BatchState::Done {
            return;
        }
        let staging = self.plan.staging_table();
        if let Err(e) = self.target.drop_table_if_exists(&staging).await {
            warn!(table = %self.plan.target_table, "failed to drop staging table on abort: {e}");
        }
        info!(table = %self.plan.target_table, "batch.abort");
    }
}
