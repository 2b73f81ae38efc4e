//! Per-target-table sync metadata, persisted on the target.
//!
//! One row per target table in `meta_last_sync_times`. Updates for a given
//! table are serialized by the caller (the per-table scheduler lock); the
//! registry makes no cross-row guarantees.

use crate::adapter::{ColumnInfo, DatabaseAdapter};
use crate::error::Result;
use crate::value::SqlValue;

pub const REGISTRY_TABLE: &str = "meta_last_sync_times";

const METADATA_COLUMNS: [&str; 4] = [
    "target_table",
    "last_synced_at",
    "last_batch_synced_at",
    "last_row_at",
];

/// Sync state of one target table.
///
/// `last_synced_at` and `last_batch_synced_at` are wall-clock epoch
/// seconds. `last_row_at` is the maximum timestamp-column value observed in
/// the last successful load, in the source's own unit (seconds or
/// milliseconds, tagged by the plan's `timestamp_in_millis`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMetadata {
    pub target_table: String,
    pub last_synced_at: Option<i64>,
    pub last_batch_synced_at: Option<i64>,
    pub last_row_at: Option<i64>,
}

/// Partial update; `None` fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    pub last_synced_at: Option<i64>,
    pub last_batch_synced_at: Option<i64>,
    pub last_row_at: Option<i64>,
}

pub struct TableRegistry;

impl TableRegistry {
    /// Idempotent storage creation. A concurrent creator winning the race
    /// reports "already exists", which is success here.
    pub async fn ensure_storage_exists(target: &mut dyn DatabaseAdapter) -> Result<()> {
        if target.table_exists(REGISTRY_TABLE).await? {
            return Ok(());
        }
        let columns = [
            ColumnInfo::new("target_table", "varchar(255)").primary_key(),
            ColumnInfo::new("last_synced_at", "bigint"),
            ColumnInfo::new("last_batch_synced_at", "bigint"),
            ColumnInfo::new("last_row_at", "bigint"),
        ];
        match target.create_table(REGISTRY_TABLE, &columns, None).await {
            Ok(()) => Ok(()),
            Err(e) if chain_mentions(&e, &["already exists", "duplicate table"]) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn get(
        target: &mut dyn DatabaseAdapter,
        table: &str,
    ) -> Result<Option<SyncMetadata>> {
        let row = target
            .select_row(
                REGISTRY_TABLE,
                "target_table",
                table,
                &METADATA_COLUMNS[1..],
            )
            .await?;
        Ok(row.map(|values| SyncMetadata {
            target_table: table.to_string(),
            last_synced_at: values[0].as_i64(),
            last_batch_synced_at: values[1].as_i64(),
            last_row_at: values[2].as_i64(),
        }))
    }

    pub async fn set(
        target: &mut dyn DatabaseAdapter,
        table: &str,
        update: &MetadataUpdate,
    ) -> Result<()> {
        let mut assignments: Vec<(String, SqlValue)> = Vec::new();
        if let Some(at) = update.last_synced_at {
            assignments.push(("last_synced_at".to_string(), SqlValue::Int(at)));
        }
        if let Some(at) = update.last_batch_synced_at {
            assignments.push(("last_batch_synced_at".to_string(), SqlValue::Int(at)));
        }
        if let Some(at) = update.last_row_at {
            assignments.push(("last_row_at".to_string(), SqlValue::Int(at)));
        }
        if assignments.is_empty() {
            return Ok(());
        }
        target
            .upsert(REGISTRY_TABLE, "target_table", table, &assignments)
            .await
    }

    pub async fn delete(target: &mut dyn DatabaseAdapter, table: &str) -> Result<()> {
        target
            .delete_row(REGISTRY_TABLE, "target_table", table)
            .await
    }

    pub async fn all(target: &mut dyn DatabaseAdapter) -> Result<Vec<SyncMetadata>> {
        let rows = target.select_all(REGISTRY_TABLE, &METADATA_COLUMNS).await?;
        Ok(rows
            .into_iter()
            .map(|values| SyncMetadata {
                target_table: values[0].as_str().unwrap_or_default().to_string(),
                last_synced_at: values[1].as_i64(),
                last_batch_synced_at: values[2].as_i64(),
                last_row_at: values[3].as_i64(),
            })
            .collect())
    }
}

fn chain_mentions(err: &crate::error::SyncError, needles: &[&str]) -> bool {
    let mut current: Option<&dyn std::error::Error> = Some(err);
    while let Some(e) = current {
        let message = e.to_string().to_lowercase();
        if needles.iter().any(|n| message.contains(n)) {
            return true;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Engine;
    use crate::testing::{MemoryAdapter, MemoryDb};

    fn target() -> MemoryAdapter {
        MemoryAdapter::new(MemoryDb::shared(), Engine::Postgres)
    }

    #[tokio::test]
    async fn test_ensure_storage_is_idempotent() {
        let mut target = target();
        TableRegistry::ensure_storage_exists(&mut target).await.unwrap();
        TableRegistry::ensure_storage_exists(&mut target).await.unwrap();
        assert!(target.table_exists(REGISTRY_TABLE).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_missing_row() {
        let mut target = target();
        TableRegistry::ensure_storage_exists(&mut target).await.unwrap();
        let meta = TableRegistry::get(&mut target, "users").await.unwrap();
        assert!(meta.is_none());
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        let mut target = target();
        TableRegistry::ensure_storage_exists(&mut target).await.unwrap();

        let update = MetadataUpdate {
            last_synced_at: Some(1_700_000_100),
            last_batch_synced_at: Some(1_700_000_000),
            last_row_at: Some(1_699_999_990),
        };
        TableRegistry::set(&mut target, "users", &update).await.unwrap();

        let meta = TableRegistry::get(&mut target, "users").await.unwrap().unwrap();
        assert_eq!(meta.last_synced_at, Some(1_700_000_100));
        assert_eq!(meta.last_batch_synced_at, Some(1_700_000_000));
        assert_eq!(meta.last_row_at, Some(1_699_999_990));
    }

    #[tokio::test]
    async fn test_partial_update_preserves_other_fields() {
        let mut target = target();
        TableRegistry::ensure_storage_exists(&mut target).await.unwrap();

        TableRegistry::set(
            &mut target,
            "users",
            &MetadataUpdate {
                last_synced_at: Some(100),
                last_batch_synced_at: Some(90),
                last_row_at: Some(80),
            },
        )
        .await
        .unwrap();

        // An incremental pass only touches two of the three fields.
        TableRegistry::set(
            &mut target,
            "users",
            &MetadataUpdate {
                last_synced_at: Some(200),
                last_row_at: Some(150),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let meta = TableRegistry::get(&mut target, "users").await.unwrap().unwrap();
        assert_eq!(meta.last_synced_at, Some(200));
        assert_eq!(meta.last_batch_synced_at, Some(90));
        assert_eq!(meta.last_row_at, Some(150));
    }

    #[tokio::test]
    async fn test_delete_and_all() {
        let mut target = target();
        TableRegistry::ensure_storage_exists(&mut target).await.unwrap();

        for table in ["a", "b"] {
            TableRegistry::set(
                &mut target,
                table,
                &MetadataUpdate {
                    last_synced_at: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        assert_eq!(TableRegistry::all(&mut target).await.unwrap().len(), 2);

        TableRegistry::delete(&mut target, "a").await.unwrap();
        let remaining = TableRegistry::all(&mut target).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].target_table, "b");
    }
}
