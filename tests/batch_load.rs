//! Batch load E2E tests over the in-memory adapter: staging lifecycle,
//! projection resolution, duplicate tolerance, crash recovery, and the
//! post-load catch-up window.

use chrono::{Duration, TimeZone, Utc};
use warehouse_sync::actions::{ActionConfig, BatchLoadAction, BatchState};
use warehouse_sync::adapter::Engine;
use warehouse_sync::clock::{Clock, ManualClock};
use warehouse_sync::error::SyncError;
use warehouse_sync::plan::{ColumnSelection, IndexSpec, TablePlan};
use warehouse_sync::registry::TableRegistry;
use warehouse_sync::testing::{
    define_table, insert_row, table_exists_in, table_rows, MemoryAdapter, MemoryDb,
};
use warehouse_sync::value::SqlValue;

fn manual_clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap())
}

fn test_plan() -> TablePlan {
    let mut plan = TablePlan::new("main", "test_table", "target_test_table");
    plan.columns = ColumnSelection::Named(vec![
        "id".to_string(),
        "col1".to_string(),
        "updated_at".to_string(),
    ]);
    plan
}

fn define_source(db: &warehouse_sync::testing::SharedDb) {
    define_table(
        db,
        "test_table",
        &[
            ("id", "int", true),
            ("col1", "varchar(255)", false),
            ("updated_at", "bigint", false),
        ],
    );
}

#[tokio::test]
async fn test_batch_load_with_rename_divergence() {
    let source_db = MemoryDb::shared();
    let target_db = MemoryDb::shared();
    let clock = manual_clock();
    let now = clock.now().timestamp();

    define_source(&source_db);
    insert_row(
        &source_db,
        "test_table",
        &[
            ("id", SqlValue::Int(1)),
            ("col1", SqlValue::from("hello")),
            ("updated_at", SqlValue::Int(now - 10)),
        ],
    );

    let mut source = MemoryAdapter::new(source_db.clone(), Engine::MySql);
    let mut target = MemoryAdapter::new(target_db.clone(), Engine::Postgres);
    TableRegistry::ensure_storage_exists(&mut target).await.unwrap();

    let plan = test_plan();
    let config = ActionConfig::default();
    BatchLoadAction::new(&plan, &mut source, &mut target, &clock, &config)
        .run()
        .await
        .unwrap();

    let rows = table_rows(&target_db, "target_test_table");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&SqlValue::Int(1)));
    assert_eq!(rows[0].get("col1"), Some(&SqlValue::from("hello")));

    // Staging is gone after a successful action, and the source table is
    // untouched under its own name.
    assert!(!table_exists_in(&target_db, "new_target_test_table"));
    assert_eq!(table_rows(&source_db, "test_table").len(), 1);

    let meta = TableRegistry::get(&mut target, "target_test_table")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta.last_row_at, Some(now - 10));
    assert_eq!(meta.last_batch_synced_at, Some(now));
    assert!(meta.last_synced_at >= meta.last_batch_synced_at);
}

#[tokio::test]
async fn test_batch_load_drops_missing_source_column() {
    let source_db = MemoryDb::shared();
    let target_db = MemoryDb::shared();
    let clock = manual_clock();
    let now = clock.now().timestamp();

    // col1 never existed on this source; the projection silently shrinks.
    define_table(
        &source_db,
        "test_table",
        &[("id", "int", true), ("updated_at", "bigint", false)],
    );
    insert_row(
        &source_db,
        "test_table",
        &[("id", SqlValue::Int(1)), ("updated_at", SqlValue::Int(now - 10))],
    );

    let mut source = MemoryAdapter::new(source_db, Engine::MySql);
    let mut target = MemoryAdapter::new(target_db.clone(), Engine::Postgres);
    TableRegistry::ensure_storage_exists(&mut target).await.unwrap();

    let plan = test_plan();
    let config = ActionConfig::default();
    BatchLoadAction::new(&plan, &mut source, &mut target, &clock, &config)
        .run()
        .await
        .unwrap();

    let rows = table_rows(&target_db, "target_test_table");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&SqlValue::Int(1)));
    assert!(!rows[0].contains_key("col1"));
}

#[tokio::test]
async fn test_batch_load_ignores_duplicate_unique_keys() {
    let source_db = MemoryDb::shared();
    let target_db = MemoryDb::shared();
    let clock = manual_clock();
    let now = clock.now().timestamp();

    define_source(&source_db);
    for id in [2, 3] {
        insert_row(
            &source_db,
            "test_table",
            &[
                ("id", SqlValue::Int(id)),
                ("col1", SqlValue::from("hello")),
                ("updated_at", SqlValue::Int(now - 10)),
            ],
        );
    }

    let mut source = MemoryAdapter::new(source_db, Engine::MySql);
    let mut target = MemoryAdapter::new(target_db.clone(), Engine::Postgres);
    TableRegistry::ensure_storage_exists(&mut target).await.unwrap();

    let mut plan = test_plan();
    plan.indexes.insert(
        "col1_unique".to_string(),
        IndexSpec {
            columns: vec!["col1".to_string()],
            unique: true,
        },
    );
    let config = ActionConfig::default();
    BatchLoadAction::new(&plan, &mut source, &mut target, &clock, &config)
        .run()
        .await
        .unwrap();

    // The second insert with the same unique key is silently dropped.
    let rows = table_rows(&target_db, "target_test_table");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&SqlValue::Int(2)));
}

#[tokio::test]
async fn test_batch_load_discards_leftover_staging() {
    let source_db = MemoryDb::shared();
    let target_db = MemoryDb::shared();
    let clock = manual_clock();
    let now = clock.now().timestamp();

    define_source(&source_db);
    for (id, col1) in [(1, "hello"), (7, "old")] {
        insert_row(
            &source_db,
            "test_table",
            &[
                ("id", SqlValue::Int(id)),
                ("col1", SqlValue::from(col1)),
                ("updated_at", SqlValue::Int(now - 10)),
            ],
        );
    }

    // A prior run crashed mid-load and left a partial staging table.
    define_table(
        &target_db,
        "new_test_table",
        &[
            ("id", "int", true),
            ("col1", "varchar(255)", false),
            ("updated_at", "bigint", false),
        ],
    );
    insert_row(
        &target_db,
        "new_test_table",
        &[
            ("id", SqlValue::Int(2)),
            ("col1", SqlValue::from("already loaded")),
            ("updated_at", SqlValue::Int(now - 100)),
        ],
    );

    let mut source = MemoryAdapter::new(source_db, Engine::MySql);
    let mut target = MemoryAdapter::new(target_db.clone(), Engine::Postgres);
    TableRegistry::ensure_storage_exists(&mut target).await.unwrap();

    let mut plan = test_plan();
    plan.target_table = "test_table".to_string();
    let config = ActionConfig::default();
    BatchLoadAction::new(&plan, &mut source, &mut target, &clock, &config)
        .run()
        .await
        .unwrap();

    let mut ids: Vec<i64> = table_rows(&target_db, "test_table")
        .iter()
        .filter_map(|r| r.get("id").and_then(|v| v.as_i64()))
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 7]);
    assert!(!table_exists_in(&target_db, "new_test_table"));
}

#[tokio::test]
async fn test_post_load_catches_rows_written_during_extract() {
    let source_db = MemoryDb::shared();
    let target_db = MemoryDb::shared();
    let clock = manual_clock();
    let now = clock.now().timestamp();

    define_source(&source_db);
    insert_row(
        &source_db,
        "test_table",
        &[
            ("id", SqlValue::Int(1)),
            ("col1", SqlValue::from("hello")),
            ("updated_at", SqlValue::Int(now - 10)),
        ],
    );

    let mut source = MemoryAdapter::new(source_db.clone(), Engine::MySql);
    let mut target = MemoryAdapter::new(target_db.clone(), Engine::Postgres);
    TableRegistry::ensure_storage_exists(&mut target).await.unwrap();

    let plan = test_plan();
    let config = ActionConfig::default();
    let mut action = BatchLoadAction::new(&plan, &mut source, &mut target, &clock, &config);
    assert_eq!(action.state(), BatchState::Idle);
    action.prepare().await.unwrap();
    assert_eq!(action.state(), BatchState::Prepared);
    action.extract_and_load().await.unwrap();
    assert_eq!(action.state(), BatchState::Loaded);

    // A row commits on the source after the full copy finished.
    insert_row(
        &source_db,
        "test_table",
        &[
            ("id", SqlValue::Int(2)),
            ("col1", SqlValue::from("late")),
            ("updated_at", SqlValue::Int(clock.now().timestamp())),
        ],
    );
    clock.advance(Duration::minutes(10));

    action.post_load().await.unwrap();
    assert_eq!(action.state(), BatchState::CaughtUp);
    action.commit().await.unwrap();
    assert_eq!(action.state(), BatchState::Done);

    let mut ids: Vec<i64> = table_rows(&target_db, "target_test_table")
        .iter()
        .filter_map(|r| r.get("id").and_then(|v| v.as_i64()))
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2]);
}

#[tokio::test]
async fn test_missing_source_table_fails_before_staging() {
    let source_db = MemoryDb::shared();
    let target_db = MemoryDb::shared();
    let clock = manual_clock();

    let mut source = MemoryAdapter::new(source_db, Engine::MySql);
    let mut target = MemoryAdapter::new(target_db.clone(), Engine::Postgres);

    let plan = test_plan();
    let config = ActionConfig::default();
    let err = BatchLoadAction::new(&plan, &mut source, &mut target, &clock, &config)
        .run()
        .await
        .unwrap_err();

    // A missing source table is a load failure caused by the missing
    // relation, and no staging table is ever created.
    assert!(matches!(err, SyncError::Load { .. }));
    let cause = std::error::Error::source(&err)
        .expect("load failure carries its cause")
        .to_string();
    assert!(cause.contains("no such table"));
    assert!(!table_exists_in(&target_db, "new_target_test_table"));
}

#[tokio::test]
async fn test_failed_batch_leaves_live_table_unchanged() {
    let source_db = MemoryDb::shared();
    let target_db = MemoryDb::shared();
    let clock = manual_clock();
    let now = clock.now().timestamp();

    define_source(&source_db);
    insert_row(
        &source_db,
        "test_table",
        &[
            ("id", SqlValue::Int(9)),
            ("col1", SqlValue::from("new data")),
            ("updated_at", SqlValue::Int(now)),
        ],
    );

    // The live table already carries a previous generation.
    define_table(
        &target_db,
        "target_test_table",
        &[
            ("id", "int", true),
            ("col1", "varchar(255)", false),
            ("updated_at", "bigint", false),
        ],
    );
    insert_row(
        &target_db,
        "target_test_table",
        &[
            ("id", SqlValue::Int(1)),
            ("col1", SqlValue::from("previous")),
            ("updated_at", SqlValue::Int(now - 1000)),
        ],
    );

    let mut source =
        MemoryAdapter::new(source_db, Engine::MySql).with_failing_extracts(true);
    let mut target = MemoryAdapter::new(target_db.clone(), Engine::Postgres);
    TableRegistry::ensure_storage_exists(&mut target).await.unwrap();

    let plan = test_plan();
    let config = ActionConfig::default();
    let err = BatchLoadAction::new(&plan, &mut source, &mut target, &clock, &config)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Extract { .. }));

    // Pre-action state survives intact: one old row, no staging, no
    // registry entry.
    let rows = table_rows(&target_db, "target_test_table");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("col1"), Some(&SqlValue::from("previous")));
    assert!(!table_exists_in(&target_db, "new_target_test_table"));
    let meta = TableRegistry::get(&mut target, "target_test_table")
        .await
        .unwrap();
    assert!(meta.is_none());
}

#[tokio::test]
async fn test_batch_load_resolves_all_projection() {
    let source_db = MemoryDb::shared();
    let target_db = MemoryDb::shared();
    let clock = manual_clock();
    let now = clock.now().timestamp();

    define_source(&source_db);
    insert_row(
        &source_db,
        "test_table",
        &[
            ("id", SqlValue::Int(5)),
            ("col1", SqlValue::from("every column")),
            ("updated_at", SqlValue::Int(now - 3)),
        ],
    );

    let mut source = MemoryAdapter::new(source_db, Engine::MySql);
    let mut target = MemoryAdapter::new(target_db.clone(), Engine::Postgres);
    TableRegistry::ensure_storage_exists(&mut target).await.unwrap();

    let mut plan = test_plan();
    plan.columns = ColumnSelection::All;
    let config = ActionConfig::default();
    BatchLoadAction::new(&plan, &mut source, &mut target, &clock, &config)
        .run()
        .await
        .unwrap();

    let rows = table_rows(&target_db, "target_test_table");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("col1"), Some(&SqlValue::from("every column")));
    assert_eq!(rows[0].get("updated_at"), Some(&SqlValue::Int(now - 3)));
}
