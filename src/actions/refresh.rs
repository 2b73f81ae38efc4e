//! Refresh-recent: deletion-aware reload of a recent time window.
//!
//! Target rows in the window that no longer exist on the source are
//! removed, which is the only mechanism this engine has for propagating
//! deletes.

use super::{resolve_projection, ActionConfig};
use crate::adapter::{DatabaseAdapter, ExtractQuery, Filter, TimestampBound};
use crate::clock::{epoch_in, Clock};
use crate::error::Result;
use crate::pipeline::ExtractLoadPipeline;
use crate::plan::{RefreshRecent, TablePlan};
use crate::registry::{MetadataUpdate, TableRegistry};
use chrono::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Skipped,
    Refreshed { deleted: u64, loaded: u64 },
}

pub struct RefreshRecentAction<'a> {
    plan: &'a TablePlan,
    source: &'a mut dyn DatabaseAdapter,
    target: &'a mut dyn DatabaseAdapter,
    clock: &'a dyn Clock,
    config: &'a ActionConfig,
    pipeline: ExtractLoadPipeline,
}

impl<'a> RefreshRecentAction<'a> {
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

    pub async fn run(mut self) -> Result<RefreshOutcome> {
        if self.plan.refresh_recent == RefreshRecent::Disabled {
            return Ok(RefreshOutcome::Skipped);
        }
        let live = &self.plan.target_table;
        self.target.connection_reset().await?;

        if !self.target.table_exists(live).await? {
            warn!(table = %live, "refresh.skip: target table missing, batch load needed");
            return Ok(RefreshOutcome::Skipped);
        }

        let projection = resolve_projection(self.source, self.plan).await?;

        let now = self.clock.now();
        let window_start = now - Duration::seconds(self.config.refresh_window_secs);
        let in_millis = self.plan.timestamp_in_millis;

        let mut bounds = vec![TimestampBound::at_or_after(
            &self.plan.timestamp_column,
            epoch_in(window_start, in_millis),
            in_millis,
        )];
        if let RefreshRecent::ByColumn(column) = &self.plan.refresh_recent {
            // The extra column is a calendar column, compared against an
            // engine-native timestamp regardless of the plan's unit.
            bounds.push(TimestampBound::at_or_after(
                column,
                window_start.timestamp(),
                false,
            ));
        }
        let filter = Filter::Bounds(bounds);

        let deleted = self.target.delete_where(live, &filter).await?;

        let query = ExtractQuery {
            table: self.plan.source_table.clone(),
            columns: projection.columns.clone(),
            filter,
        };
        let loaded = self
            .pipeline
            .run(
                self.source,
                self.target,
                &query,
                live,
                self.plan.charset.as_deref(),
            )
            .await?;

        TableRegistry::set(
            self.target,
            live,
            &MetadataUpdate {
                last_synced_at: Some(self.clock.now().timestamp()),
                ..Default::default()
            },
        )
        .await?;

        info!(table = %live, deleted, loaded, "refresh.load");
        Ok(RefreshOutcome::Refreshed { deleted, loaded })
    }
}
