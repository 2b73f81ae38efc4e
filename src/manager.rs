//! The multi-source driver loop: supervised workers, per-table locking,
//! error policy, and graceful shutdown.
//!
//! Actions run in parallel across distinct sources and serially within a
//! source. The target is written by at most one worker per target table at
//! a time, enforced by the lock map here. Shutdown is cooperative: the
//! stop flag is checked between actions and between iterations, never
//! mid-load, because killing a bulk load can leave an inconsistent staging
//! table.

use crate::actions::{
    ActionConfig, BatchLoadAction, IncrementalLoadAction, IncrementalOutcome,
    RefreshOutcome, RefreshRecentAction,
};
use crate::adapter::{Connector, DriverConnector};
use crate::clock::SharedClock;
use crate::config::{Config, ConnectionOptions};
use crate::error::{Result, SyncError};
use crate::metrics::SyncMetrics;
use crate::plan::{PlanProvider, RefreshRecent};
use crate::registry::TableRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Cooperative stop signal shared with signal handlers.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-target-table exclusion. A lock is held for the duration of one
/// action only; no lock is ever held across iterations.
#[derive(Debug, Clone, Default)]
struct TableLocks {
    locks: Arc<StdMutex<HashMap<String, Arc<TokioMutex<()>>>>>,
}

impl TableLocks {
    async fn acquire(&self, table: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(table.to_string())
                .or_insert_with(|| Arc::new(TokioMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Tracks same-table failures across incremental iterations; a table
/// failing `limit` times in a row makes the loop escape so operators
/// notice.
#[derive(Debug)]
pub(crate) struct FailureTracker {
    counts: HashMap<String, u32>,
    limit: u32,
}

impl FailureTracker {
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            counts: HashMap::new(),
            limit: limit.max(1),
        }
    }

    pub(crate) fn succeed(&mut self, table: &str) {
        self.counts.remove(table);
    }

    /// Returns true when the table has now hit the consecutive limit.
    pub(crate) fn fail(&mut self, table: &str) -> bool {
        let count = self.counts.entry(table.to_string()).or_insert(0);
        *count += 1;
        *count >= self.limit
    }
}

/// One source's share of the work, cloned into its worker task.
#[derive(Clone)]
struct SourceContext {
    source_id: String,
    source_options: ConnectionOptions,
    target_options: ConnectionOptions,
    provider: Arc<dyn PlanProvider>,
    connector: Arc<dyn Connector>,
    clock: SharedClock,
    config: ActionConfig,
    metrics: SyncMetrics,
    locks: TableLocks,
    stop: StopHandle,
}

/// Per-source result of one pass: tables synced and table-scoped failures.
#[derive(Debug, Default)]
pub struct IterationReport {
    pub succeeded: Vec<String>,
    pub failures: Vec<(String, SyncError)>,
}

impl IterationReport {
    fn merge(&mut self, other: IterationReport) {
        self.succeeded.extend(other.succeeded);
        self.failures.extend(other.failures);
    }
}

pub struct Manager {
    sources: Vec<(String, ConnectionOptions, Arc<dyn PlanProvider>)>,
    target: ConnectionOptions,
    connector: Arc<dyn Connector>,
    clock: SharedClock,
    config: ActionConfig,
    cadence: std::time::Duration,
    max_consecutive_failures: u32,
    metrics: SyncMetrics,
    stop: StopHandle,
    locks: TableLocks,
}

impl Manager {
    pub fn from_config(config: &Config, clock: SharedClock) -> Result<Self> {
        Self::with_connector(config, clock, Arc::new(DriverConnector))
    }

    pub fn with_connector(
        config: &Config,
        clock: SharedClock,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let sources = config
            .providers()?
            .into_iter()
            .map(|(source_id, provider)| {
                let options = config.sources[&source_id].clone();
                (source_id, options, provider)
            })
            .collect();
        Ok(Self {
            sources,
            target: config.target.clone(),
            connector,
            clock,
            config: config.action_config()?,
            cadence: config.cadence_duration()?,
            max_consecutive_failures: config.max_consecutive_failures(),
            metrics: SyncMetrics::new(),
            stop: StopHandle::default(),
            locks: TableLocks::default(),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn metrics(&self) -> SyncMetrics {
        self.metrics.clone()
    }

    fn contexts(&self) -> Vec<SourceContext> {
        self.sources
            .iter()
            .map(|(source_id, options, provider)| SourceContext {
                source_id: source_id.clone(),
                source_options: options.clone(),
                target_options: self.target.clone(),
                provider: provider.clone(),
                connector: self.connector.clone(),
                clock: self.clock.clone(),
                config: self.config.clone(),
                metrics: self.metrics.clone(),
                locks: self.locks.clone(),
                stop: self.stop.clone(),
            })
            .collect()
    }

    /// Run a batch load for every plan from every provider: parallel
    /// across sources, serial within one. Per-plan failures are collected
    /// and the aggregate surfaced after all plans finish.
    pub async fn batch_nonactive(&self) -> Result<()> {
        self.batch_run(false).await
    }

    /// Batch-load only tables without a registry row; the bootstrap step
    /// of `run`.
    pub async fn batch_missing(&self) -> Result<()> {
        self.batch_run(true).await
    }

    async fn batch_run(&self, only_missing: bool) -> Result<()> {
        let mut set = JoinSet::new();
        for ctx in self.contexts() {
            set.spawn(run_batch_source(ctx, only_missing));
        }

        let mut failures: Vec<(String, SyncError)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            let report = joined
                .map_err(|e| SyncError::load("batch worker", anyhow::anyhow!(e)))??;
            failures.extend(report.failures);
        }

        aggregate("batch", failures)
    }

    /// Run refresh-recent for every plan that has it enabled.
    pub async fn refresh_recent(&self) -> Result<()> {
        let mut set = JoinSet::new();
        for ctx in self.contexts() {
            set.spawn(run_refresh_source(ctx));
        }

        let mut failures: Vec<(String, SyncError)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            let report = joined
                .map_err(|e| SyncError::load("refresh worker", anyhow::anyhow!(e)))??;
            failures.extend(report.failures);
        }

        aggregate("refresh-recent", failures)
    }

    /// The continuous loop: one incremental pass over all plans, then
    /// sleep for the cadence. Per-table errors are logged and the loop
    /// continues; a table failing consistently, or any error outside a
    /// table scope, escapes.
    pub async fn incremental(&self) -> Result<()> {
        let mut tracker = FailureTracker::new(self.max_consecutive_failures);
        loop {
            if self.stop.is_stopped() {
                break;
            }

            let report = match self.incremental_once().await {
                Ok(report) => report,
                Err(e) => {
                    self.metrics.log_summary();
                    return Err(e);
                }
            };

            for table in &report.succeeded {
                tracker.succeed(table);
            }
            let mut fatal = None;
            for (table, e) in report.failures {
                error!(table = %table, "incremental iteration failed: {e}");
                if tracker.fail(&table) {
                    warn!(
                        table = %table,
                        limit = self.max_consecutive_failures,
                        "consistent incremental failure, escaping"
                    );
                    fatal = Some(e);
                }
            }
            if let Some(e) = fatal {
                self.metrics.log_summary();
                return Err(e);
            }

            if self.stop.is_stopped() {
                break;
            }
            tokio::time::sleep(self.cadence).await;
        }

        info!("incremental loop stopped");
        self.metrics.log_summary();
        Ok(())
    }

    /// One pass of the incremental action across all plans of all sources.
    pub async fn incremental_once(&self) -> Result<IterationReport> {
        let mut set = JoinSet::new();
        for ctx in self.contexts() {
            set.spawn(run_incremental_source(ctx));
        }

        let mut report = IterationReport::default();
        while let Some(joined) = set.join_next().await {
            let source_report = joined
                .map_err(|e| SyncError::load("incremental worker", anyhow::anyhow!(e)))??;
            report.merge(source_report);
        }
        Ok(report)
    }
}

fn aggregate(what: &str, failures: Vec<(String, SyncError)>) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    let tables: Vec<String> = failures.iter().map(|(t, _)| t.clone()).collect();
    let detail = failures
        .iter()
        .map(|(t, e)| format!("{t}: {e}"))
        .collect::<Vec<_>>()
        .join("; ");
    Err(SyncError::load(
        tables.join(", "),
        anyhow::anyhow!("{what} failed for {} table(s): {detail}", failures.len()),
    ))
}

async fn run_batch_source(ctx: SourceContext, only_missing: bool) -> Result<IterationReport> {
    let mut source = ctx.connector.connect(&ctx.source_options).await?;
    let mut target = ctx.connector.connect(&ctx.target_options).await?;
    TableRegistry::ensure_storage_exists(&mut *target).await?;

    let plans = ctx.provider.plans(&mut *source).await?;
    let mut report = IterationReport::default();

    for plan in plans {
        if ctx.stop.is_stopped() {
            break;
        }
        if only_missing
            && TableRegistry::get(&mut *target, &plan.target_table)
                .await?
                .is_some()
        {
            continue;
        }

        let _guard = ctx.locks.acquire(&plan.target_table).await;
        let action = BatchLoadAction::new(
            &plan,
            &mut *source,
            &mut *target,
            ctx.clock.as_ref(),
            &ctx.config,
        );
        match action.run().await {
            Ok(()) => {
                ctx.metrics
                    .record_success("batch", &ctx.source_id, &plan.target_table);
                report.succeeded.push(plan.target_table.clone());
            }
            Err(e) => {
                error!(
                    source = %ctx.source_id,
                    table = %plan.target_table,
                    "batch load failed: {e}"
                );
                ctx.metrics
                    .record_failure("batch", &ctx.source_id, &plan.target_table);
                report.failures.push((plan.target_table.clone(), e));
            }
        }
    }
    Ok(report)
}

async fn run_refresh_source(ctx: SourceContext) -> Result<IterationReport> {
    let mut source = ctx.connector.connect(&ctx.source_options).await?;
    let mut target = ctx.connector.connect(&ctx.target_options).await?;
    TableRegistry::ensure_storage_exists(&mut *target).await?;

    let plans = ctx.provider.plans(&mut *source).await?;
    let mut report = IterationReport::default();

    for plan in plans {
        if ctx.stop.is_stopped() {
            break;
        }
        if plan.refresh_recent == RefreshRecent::Disabled {
            continue;
        }

        let _guard = ctx.locks.acquire(&plan.target_table).await;
        let action = RefreshRecentAction::new(
            &plan,
            &mut *source,
            &mut *target,
            ctx.clock.as_ref(),
            &ctx.config,
        );
        match action.run().await {
            Ok(RefreshOutcome::Refreshed { .. }) => {
                ctx.metrics
                    .record_success("refresh", &ctx.source_id, &plan.target_table);
                report.succeeded.push(plan.target_table.clone());
            }
            Ok(RefreshOutcome::Skipped) => {}
            Err(e) => {
                error!(
                    source = %ctx.source_id,
                    table = %plan.target_table,
                    "refresh-recent failed: {e}"
                );
                ctx.metrics
                    .record_failure("refresh", &ctx.source_id, &plan.target_table);
                report.failures.push((plan.target_table.clone(), e));
            }
        }
    }
    Ok(report)
}

async fn run_incremental_source(ctx: SourceContext) -> Result<IterationReport> {
    let mut source = ctx.connector.connect(&ctx.source_options).await?;
    let mut target = ctx.connector.connect(&ctx.target_options).await?;
    TableRegistry::ensure_storage_exists(&mut *target).await?;

    let plans = ctx.provider.plans(&mut *source).await?;
    let mut report = IterationReport::default();

    for plan in plans {
        if ctx.stop.is_stopped() {
            break;
        }

        let _guard = ctx.locks.acquire(&plan.target_table).await;
        let action = IncrementalLoadAction::new(
            &plan,
            &mut *source,
            &mut *target,
            ctx.clock.as_ref(),
            &ctx.config,
        );
        match action.run().await {
            Ok(IncrementalOutcome::Synced { .. }) => {
                ctx.metrics
                    .record_success("incremental", &ctx.source_id, &plan.target_table);
                report.succeeded.push(plan.target_table.clone());
            }
            Ok(IncrementalOutcome::Skipped(_)) => {}
            Err(e) if e.is_table_scoped() => {
                ctx.metrics
                    .record_failure("incremental", &ctx.source_id, &plan.target_table);
                report.failures.push((plan.target_table.clone(), e));
            }
            // Registry connectivity and the like: not a table problem,
            // escape the loop.
            Err(e) => return Err(e),
        }
    }
    Ok(report)
}
