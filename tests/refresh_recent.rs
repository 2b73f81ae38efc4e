//! Refresh-recent E2E tests: windowed delete-and-reload, which is how
//! upstream deletions reach the target.

use chrono::{TimeZone, Utc};
use warehouse_sync::actions::{ActionConfig, RefreshOutcome, RefreshRecentAction};
use warehouse_sync::adapter::Engine;
use warehouse_sync::clock::{Clock, ManualClock};
use warehouse_sync::plan::{ColumnSelection, RefreshRecent, TablePlan};
use warehouse_sync::registry::TableRegistry;
use warehouse_sync::testing::{
    define_table, insert_row, table_rows, MemoryAdapter, MemoryDb,
};
use warehouse_sync::value::SqlValue;

const WEEK: i64 = 7 * 24 * 3600;

fn manual_clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap())
}

fn test_plan() -> TablePlan {
    let mut plan = TablePlan::new("main", "orders", "orders");
    plan.columns = ColumnSelection::Named(vec![
        "id".to_string(),
        "state".to_string(),
        "updated_at".to_string(),
    ]);
    plan.refresh_recent = RefreshRecent::ByTimestamp;
    plan
}

fn columns() -> [(&'static str, &'static str, bool); 3] {
    [
        ("id", "int", true),
        ("state", "varchar(32)", false),
        ("updated_at", "bigint", false),
    ]
}

fn order(id: i64, state: &str, updated_at: i64) -> [(&'static str, SqlValue); 3] {
    [
        ("id", SqlValue::Int(id)),
        ("state", SqlValue::from(state)),
        ("updated_at", SqlValue::Int(updated_at)),
    ]
}

#[tokio::test]
async fn test_refresh_propagates_upstream_deletes() {
    let source_db = MemoryDb::shared();
    let target_db = MemoryDb::shared();
    let clock = manual_clock();
    let now = clock.now().timestamp();

    define_table(&source_db, "orders", &columns());
    define_table(&target_db, "orders", &columns());

    // id 1 still exists upstream; id 2 was deleted there; id 3 is older
    // than the window and must survive untouched.
    insert_row(&source_db, "orders", &order(1, "open", now - 100));
    insert_row(&target_db, "orders", &order(1, "open", now - 100));
    insert_row(&target_db, "orders", &order(2, "gone upstream", now - 200));
    insert_row(&target_db, "orders", &order(3, "ancient", now - 2 * WEEK));

    let mut source = MemoryAdapter::new(source_db, Engine::MySql);
    let mut target = MemoryAdapter::new(target_db.clone(), Engine::Postgres);
    TableRegistry::ensure_storage_exists(&mut target).await.unwrap();

    let plan = test_plan();
    let config = ActionConfig::default();
    let outcome = RefreshRecentAction::new(&plan, &mut source, &mut target, &clock, &config)
        .run()
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RefreshOutcome::Refreshed {
            deleted: 2,
            loaded: 1
        }
    );

    let mut ids: Vec<i64> = table_rows(&target_db, "orders")
        .iter()
        .filter_map(|r| r.get("id").and_then(|v| v.as_i64()))
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 3]);

    let meta = TableRegistry::get(&mut target, "orders").await.unwrap().unwrap();
    assert_eq!(meta.last_synced_at, Some(now));
}

#[tokio::test]
async fn test_refresh_by_column_narrows_the_window() {
    let source_db = MemoryDb::shared();
    let target_db = MemoryDb::shared();
    let clock = manual_clock();
    let now = clock.now().timestamp();

    let columns = [
        ("id", "int", true),
        ("state", "varchar(32)", false),
        ("ordered_on", "bigint", false),
        ("updated_at", "bigint", false),
    ];
    define_table(&source_db, "orders", &columns);
    define_table(&target_db, "orders", &columns);

    // Recently touched, but the order itself predates the window: kept
    // even though it is absent upstream.
    insert_row(
        &target_db,
        "orders",
        &[
            ("id", SqlValue::Int(5)),
            ("state", SqlValue::from("archived")),
            ("ordered_on", SqlValue::Int(now - 3 * WEEK)),
            ("updated_at", SqlValue::Int(now - 10)),
        ],
    );
    // Recent in both senses and gone upstream: deleted.
    insert_row(
        &target_db,
        "orders",
        &[
            ("id", SqlValue::Int(6)),
            ("state", SqlValue::from("cancelled")),
            ("ordered_on", SqlValue::Int(now - 3600)),
            ("updated_at", SqlValue::Int(now - 20)),
        ],
    );

    let mut source = MemoryAdapter::new(source_db, Engine::MySql);
    let mut target = MemoryAdapter::new(target_db.clone(), Engine::Postgres);
    TableRegistry::ensure_storage_exists(&mut target).await.unwrap();

    let mut plan = test_plan();
    plan.columns = ColumnSelection::Named(vec![
        "id".to_string(),
        "state".to_string(),
        "ordered_on".to_string(),
        "updated_at".to_string(),
    ]);
    plan.refresh_recent = RefreshRecent::ByColumn("ordered_on".to_string());
    let config = ActionConfig::default();
    RefreshRecentAction::new(&plan, &mut source, &mut target, &clock, &config)
        .run()
        .await
        .unwrap();

    let ids: Vec<i64> = table_rows(&target_db, "orders")
        .iter()
        .filter_map(|r| r.get("id").and_then(|v| v.as_i64()))
        .collect();
    assert_eq!(ids, vec![5]);
}

#[tokio::test]
async fn test_refresh_disabled_is_a_no_op() {
    let source_db = MemoryDb::shared();
    let target_db = MemoryDb::shared();
    let clock = manual_clock();
    let now = clock.now().timestamp();

    define_table(&source_db, "orders", &columns());
    define_table(&target_db, "orders", &columns());
    insert_row(&target_db, "orders", &order(2, "gone upstream", now - 200));

    let mut source = MemoryAdapter::new(source_db, Engine::MySql);
    let mut target = MemoryAdapter::new(target_db.clone(), Engine::Postgres);

    let mut plan = test_plan();
    plan.refresh_recent = RefreshRecent::Disabled;
    let config = ActionConfig::default();
    let outcome = RefreshRecentAction::new(&plan, &mut source, &mut target, &clock, &config)
        .run()
        .await
        .unwrap();

    assert_eq!(outcome, RefreshOutcome::Skipped);
    assert_eq!(table_rows(&target_db, "orders").len(), 1);
}

#[tokio::test]
async fn test_refresh_reloads_changed_rows() {
    let source_db = MemoryDb::shared();
    let target_db = MemoryDb::shared();
    let clock = manual_clock();
    let now = clock.now().timestamp();

    define_table(&source_db, "orders", &columns());
    define_table(&target_db, "orders", &columns());

    // Upstream mutated a row in place; the reload picks up the new state.
    insert_row(&source_db, "orders", &order(1, "shipped", now - 50));
    insert_row(&target_db, "orders", &order(1, "open", now - 100));

    let mut source = MemoryAdapter::new(source_db, Engine::MySql);
    let mut target = MemoryAdapter::new(target_db.clone(), Engine::Postgres);
    TableRegistry::ensure_storage_exists(&mut target).await.unwrap();

    let plan = test_plan();
    let config = ActionConfig::default();
    RefreshRecentAction::new(&plan, &mut source, &mut target, &clock, &config)
        .run()
        .await
        .unwrap();

    let rows = table_rows(&target_db, "orders");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("state"), Some(&SqlValue::from("shipped")));
}
