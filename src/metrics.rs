//! Success/failure counters per (action, source-id, table).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct MetricsKey {
    action: &'static str,
    source_id: String,
    table: String,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counts {
    success: u64,
    failure: u64,
}

/// One snapshot line, serialized as JSON for log scrapers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsEntry {
    pub action: String,
    pub source_id: String,
    pub table: String,
    pub success: u64,
    pub failure: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SyncMetrics {
    counters: Arc<Mutex<BTreeMap<MetricsKey, Counts>>>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, action: &'static str, source_id: &str, table: &str) {
        self.bump(action, source_id, table, true);
    }

    pub fn record_failure(&self, action: &'static str, source_id: &str, table: &str) {
        self.bump(action, source_id, table, false);
    }

    fn bump(&self, action: &'static str, source_id: &str, table: &str, success: bool) {
        let mut counters = self.counters.lock().unwrap();
        let counts = counters
            .entry(MetricsKey {
                action,
                source_id: source_id.to_string(),
                table: table.to_string(),
            })
            .or_default();
        if success {
            counts.success += 1;
        } else {
            counts.failure += 1;
        }
    }

    pub fn snapshot(&self) -> Vec<MetricsEntry> {
        let counters = self.counters.lock().unwrap();
        counters
            .iter()
            .map(|(key, counts)| MetricsEntry {
                action: key.action.to_string(),
                source_id: key.source_id.clone(),
                table: key.table.clone(),
                success: counts.success,
                failure: counts.failure,
            })
            .collect()
    }

    /// Emit the snapshot as one JSON line per counter.
    pub fn log_summary(&self) {
        for entry in self.snapshot() {
            if let Ok(line) = serde_json::to_string(&entry) {
                info!("metrics {line}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_key() {
        let metrics = SyncMetrics::new();
        metrics.record_success("batch", "main", "users");
        metrics.record_success("batch", "main", "users");
        metrics.record_failure("batch", "main", "users");
        metrics.record_success("incremental", "main", "users");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.len(), 2);

        let batch = snapshot.iter().find(|e| e.action == "batch").unwrap();
        assert_eq!(batch.success, 2);
        assert_eq!(batch.failure, 1);

        let incremental = snapshot.iter().find(|e| e.action == "incremental").unwrap();
        assert_eq!(incremental.success, 1);
        assert_eq!(incremental.failure, 0);
    }

    #[test]
    fn test_clone_shares_counters() {
        let metrics = SyncMetrics::new();
        let cloned = metrics.clone();
        cloned.record_success("refresh", "main", "orders");
        assert_eq!(metrics.snapshot().len(), 1);
    }

    #[test]
    fn test_entry_serializes() {
        let metrics = SyncMetrics::new();
        metrics.record_failure("batch", "main", "users");
        let json = serde_json::to_string(&metrics.snapshot()[0]).unwrap();
        assert!(json.contains("\"failure\":1"));
        assert!(json.contains("\"table\":\"users\""));
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = SyncMetrics::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        m.record_success("incremental", "main", "users");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.snapshot()[0].success, 800);
    }
}
