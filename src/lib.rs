//! warehouse-sync
//!
//! A library for continuously replicating tables from MySQL and PostgreSQL
//! databases into a single analytical warehouse.
//!
//! # Features
//!
//! - Batch load: full copy into a staging table, then an atomic swap
//! - Incremental load: timestamp-driven deltas with an overlap window for
//!   clock skew, idempotent on primary key
//! - Refresh-recent: deletion-aware reload of a recent time window
//! - Bulk movement through the engines' own clients and delimited files
//! - Multiple sources synced in parallel, tables within a source in order
//! - Sync positions persisted on the target, so restarts pick up where the
//!   previous process left off
//!
//! # Architecture
//!
//! Each source contributes a set of [`plan::TablePlan`]s through a
//! [`plan::PlanProvider`]. The [`manager::Manager`] materializes plans
//! every cycle, runs one [`actions`] state machine per table through the
//! engine-specific [`adapter::DatabaseAdapter`]s, and records progress in
//! the [`registry::TableRegistry`] on the target.
//!
//! # CLI Usage
//!
//! ```bash
//! # Full copy of every planned table
//! warehouse-sync --config sync.yml batch
//!
//! # Continuous delta replication
//! warehouse-sync --config sync.yml incremental
//!
//! # Bootstrap missing tables, then follow
//! warehouse-sync --config sync.yml run
//! ```

pub mod actions;
pub mod adapter;
pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod pipeline;
pub mod plan;
pub mod registry;
pub mod testing;
pub mod value;

pub use actions::{ActionConfig, BatchLoadAction, IncrementalLoadAction, RefreshRecentAction};
pub use adapter::{DatabaseAdapter, Engine};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{Config, ConnectionOptions};
pub use error::{Result, SyncError};
pub use manager::Manager;
pub use plan::{ColumnSelection, PlanProvider, RefreshRecent, TablePlan};
pub use registry::{SyncMetadata, TableRegistry};
