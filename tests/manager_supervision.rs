//! Manager loop tests: supervision policy, consistent-failure escape,
//! bootstrap behavior, and cooperative shutdown.

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use warehouse_sync::adapter::Engine;
use warehouse_sync::clock::{Clock, ManualClock};
use warehouse_sync::config::Config;
use warehouse_sync::error::SyncError;
use warehouse_sync::manager::Manager;
use warehouse_sync::registry::{MetadataUpdate, TableRegistry};
use warehouse_sync::testing::{
    define_table, insert_row, table_rows, MemoryAdapter, MemoryConnector,
};
use warehouse_sync::value::SqlValue;

fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap(),
    ))
}

fn single_source_config() -> Config {
    Config::from_yaml(
        r#"
sources:
  main:
    engine: postgres
    user: test
    database: app
target:
  engine: postgres
  user: test
  database: warehouse
plans:
  - target_table: events
    source_table: events
    source_id: main
    columns: [id, payload, updated_at]
cadence: "0"
"#,
    )
    .unwrap()
}

const EVENT_COLUMNS: [(&str, &str, bool); 3] = [
    ("id", "int", true),
    ("payload", "varchar(255)", false),
    ("updated_at", "bigint", false),
];

async fn seed_baseline(connector: &MemoryConnector, table: &str, last_row_at: i64) {
    let warehouse = connector.db("warehouse");
    define_table(&warehouse, table, &EVENT_COLUMNS);
    let mut target = MemoryAdapter::new(warehouse, Engine::Postgres);
    TableRegistry::ensure_storage_exists(&mut target).await.unwrap();
    TableRegistry::set(
        &mut target,
        table,
        &MetadataUpdate {
            last_synced_at: Some(last_row_at),
            last_batch_synced_at: Some(last_row_at),
            last_row_at: Some(last_row_at),
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_consistent_incremental_failure_escapes_the_loop() {
    let clock = manual_clock();
    let now = clock.now().timestamp();

    let connector = MemoryConnector::failing_extracts();
    define_table(&connector.db("app"), "events", &EVENT_COLUMNS);
    seed_baseline(&connector, "events", now - 100).await;

    let manager =
        Manager::with_connector(&single_source_config(), clock, Arc::new(connector)).unwrap();

    // Every iteration fails with an extract error; the loop must
    // terminate by propagating instead of spinning forever.
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        manager.incremental(),
    )
    .await
    .expect("the loop must not run forever");

    let err = result.unwrap_err();
    assert!(matches!(err, SyncError::Extract { .. }));

    let snapshot = manager.metrics().snapshot();
    let entry = snapshot
        .iter()
        .find(|e| e.action == "incremental" && e.table == "events")
        .unwrap();
    assert!(entry.failure >= 3);
    assert_eq!(entry.success, 0);
}

#[tokio::test]
async fn test_transient_failures_do_not_escape() {
    let clock = manual_clock();
    let now = clock.now().timestamp();

    let connector = MemoryConnector::new();
    define_table(&connector.db("app"), "events", &EVENT_COLUMNS);
    insert_row(
        &connector.db("app"),
        "events",
        &[
            ("id", SqlValue::Int(1)),
            ("payload", SqlValue::from("p")),
            ("updated_at", SqlValue::Int(now - 5)),
        ],
    );
    seed_baseline(&connector, "events", now - 100).await;

    let warehouse = connector.db("warehouse");
    let manager =
        Manager::with_connector(&single_source_config(), clock, Arc::new(connector)).unwrap();

    // A healthy pass reports the table as succeeded and nothing escapes.
    let report = manager.incremental_once().await.unwrap();
    assert_eq!(report.succeeded, vec!["events".to_string()]);
    assert!(report.failures.is_empty());

    assert_eq!(table_rows(&warehouse, "events").len(), 1);
}

#[tokio::test]
async fn test_stop_flag_ends_the_loop() {
    let clock = manual_clock();
    let now = clock.now().timestamp();

    let connector = MemoryConnector::new();
    define_table(&connector.db("app"), "events", &EVENT_COLUMNS);
    seed_baseline(&connector, "events", now - 100).await;

    let manager =
        Manager::with_connector(&single_source_config(), clock, Arc::new(connector)).unwrap();
    let stop = manager.stop_handle();

    let worker = tokio::spawn(async move { manager.incremental().await });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    stop.stop();

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), worker)
        .await
        .expect("stop must end the loop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_batch_failures_are_aggregated() {
    let clock = manual_clock();

    let connector = MemoryConnector::failing_extracts();
    define_table(&connector.db("app"), "events", &EVENT_COLUMNS);
    connector.db("warehouse");

    let manager =
        Manager::with_connector(&single_source_config(), clock, Arc::new(connector)).unwrap();

    let err = manager.batch_nonactive().await.unwrap_err();
    assert!(matches!(err, SyncError::Load { .. }));
    assert!(err.to_string().contains("events"));

    let snapshot = manager.metrics().snapshot();
    let entry = snapshot.iter().find(|e| e.action == "batch").unwrap();
    assert_eq!(entry.failure, 1);
}

#[tokio::test]
async fn test_batch_missing_only_bootstraps_new_tables() {
    let clock = manual_clock();
    let now = clock.now().timestamp();

    let config = Config::from_yaml(
        r#"
sources:
  main:
    engine: postgres
    user: test
    database: app
target:
  engine: postgres
  user: test
  database: warehouse
plans:
  - target_table: events
    source_table: events
    source_id: main
    columns: [id, payload, updated_at]
  - target_table: settled
    source_table: settled
    source_id: main
    columns: [id, payload, updated_at]
cadence: "0"
"#,
    )
    .unwrap();

    let connector = MemoryConnector::new();
    let app = connector.db("app");
    define_table(&app, "events", &EVENT_COLUMNS);
    insert_row(
        &app,
        "events",
        &[
            ("id", SqlValue::Int(1)),
            ("payload", SqlValue::from("new table data")),
            ("updated_at", SqlValue::Int(now - 5)),
        ],
    );
    define_table(&app, "settled", &EVENT_COLUMNS);
    insert_row(
        &app,
        "settled",
        &[
            ("id", SqlValue::Int(2)),
            ("payload", SqlValue::from("upstream changed")),
            ("updated_at", SqlValue::Int(now - 5)),
        ],
    );

    // "settled" already has a registry row and target data from an earlier
    // deployment; the bootstrap must not rebuild it.
    seed_baseline(&connector, "settled", now - 100).await;
    let warehouse = connector.db("warehouse");
    insert_row(
        &warehouse,
        "settled",
        &[
            ("id", SqlValue::Int(2)),
            ("payload", SqlValue::from("original")),
            ("updated_at", SqlValue::Int(now - 100)),
        ],
    );

    let manager = Manager::with_connector(&config, clock, Arc::new(connector)).unwrap();
    manager.batch_missing().await.unwrap();

    // The new table was loaded; the settled one kept its bytes.
    let events = table_rows(&warehouse, "events");
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].get("payload"),
        Some(&SqlValue::from("new table data"))
    );
    let settled = table_rows(&warehouse, "settled");
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].get("payload"), Some(&SqlValue::from("original")));
}

#[tokio::test]
async fn test_incremental_once_covers_multiple_sources() {
    let clock = manual_clock();
    let now = clock.now().timestamp();

    let config = Config::from_yaml(
        r#"
sources:
  alpha:
    engine: postgres
    user: test
    database: app_alpha
  beta:
    engine: postgres
    user: test
    database: app_beta
target:
  engine: postgres
  user: test
  database: warehouse
plans:
  - target_table: events_alpha
    source_table: events
    source_id: alpha
    columns: [id, payload, updated_at]
  - target_table: events_beta
    source_table: events
    source_id: beta
    columns: [id, payload, updated_at]
cadence: "0"
"#,
    )
    .unwrap();

    let connector = MemoryConnector::new();
    for (db, table) in [("app_alpha", "events_alpha"), ("app_beta", "events_beta")] {
        let source = connector.db(db);
        define_table(&source, "events", &EVENT_COLUMNS);
        insert_row(
            &source,
            "events",
            &[
                ("id", SqlValue::Int(1)),
                ("payload", SqlValue::from(db)),
                ("updated_at", SqlValue::Int(now - 5)),
            ],
        );
        seed_baseline(&connector, table, now - 100).await;
    }
    let warehouse = connector.db("warehouse");

    let manager = Manager::with_connector(&config, clock, Arc::new(connector)).unwrap();
    let report = manager.incremental_once().await.unwrap();

    let mut succeeded = report.succeeded.clone();
    succeeded.sort();
    assert_eq!(succeeded, vec!["events_alpha", "events_beta"]);
    assert_eq!(table_rows(&warehouse, "events_alpha").len(), 1);
    assert_eq!(table_rows(&warehouse, "events_beta").len(), 1);
}
