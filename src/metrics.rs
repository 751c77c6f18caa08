use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

/// Counters for one bucket.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BucketMetrics {
    pub dispatched: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub invalid: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum DispatchEvent {
    Dispatched,
    Succeeded,
    Retried,
    Invalid,
    Failed,
}

/// Per-bucket dispatch counters with a process-wide rollup.
#[derive(Debug, Clone, Default)]
pub(crate) struct MetricsCollector {
    buckets: Arc<RwLock<HashMap<String, BucketMetrics>>>,
}

impl MetricsCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn record(&self, key: &str, event: DispatchEvent) {
        let mut buckets = self.buckets.write().await;
        let metrics = buckets.entry(key.to_string()).or_default();
        match event {
            DispatchEvent::Dispatched => metrics.dispatched += 1,
            DispatchEvent::Succeeded => metrics.succeeded += 1,
            DispatchEvent::Retried => metrics.retried += 1,
            DispatchEvent::Invalid => metrics.invalid += 1,
            DispatchEvent::Failed => metrics.failed += 1,
        }
    }

    pub(crate) async fn bucket(&self, key: &str) -> Option<BucketMetrics> {
        self.buckets.read().await.get(key).cloned()
    }

    pub(crate) async fn snapshot(&self) -> MetricsSnapshot {
        let buckets = self.buckets.read().await.clone();
        let mut totals = BucketMetrics::default();
        for metrics in buckets.values() {
            totals.dispatched += metrics.dispatched;
            totals.succeeded += metrics.succeeded;
            totals.retried += metrics.retried;
            totals.invalid += metrics.invalid;
            totals.failed += metrics.failed;
        }
        MetricsSnapshot { totals, buckets }
    }
}

/// Point-in-time copy of all dispatch counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub totals: BucketMetrics,
    pub buckets: HashMap<String, BucketMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rollup_sums_across_buckets() {
        let collector = MetricsCollector::new();
        collector.record("a", DispatchEvent::Dispatched).await;
        collector.record("a", DispatchEvent::Succeeded).await;
        collector.record("b", DispatchEvent::Dispatched).await;
        collector.record("b", DispatchEvent::Retried).await;
        collector.record("b", DispatchEvent::Failed).await;

        let snapshot = collector.snapshot().await;
        assert_eq!(snapshot.totals.dispatched, 2);
        assert_eq!(snapshot.totals.succeeded, 1);
        assert_eq!(snapshot.totals.retried, 1);
        assert_eq!(snapshot.totals.failed, 1);
        assert_eq!(snapshot.buckets.len(), 2);

        let a = collector.bucket("a").await.unwrap();
        assert_eq!(a.dispatched, 1);
        assert_eq!(a.failed, 0);
    }

    #[tokio::test]
    async fn snapshot_serializes_for_observability() {
        let collector = MetricsCollector::new();
        collector.record("a", DispatchEvent::Dispatched).await;
        let json = serde_json::to_value(collector.snapshot().await).unwrap();
        assert_eq!(json["totals"]["dispatched"], 1);
    }
}
