use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::bucket::{BucketHandle, BucketSnapshot, QueuedRequest};
use crate::dispatcher::Shared;

#[derive(Default)]
struct Tables {
    /// bucket key (`method:route:major`) to handle.
    by_route: HashMap<String, BucketHandle>,
    /// Server-reported bucket identifier to its canonical handle.
    by_server_id: HashMap<String, BucketHandle>,
}

/// Owns the bucket map: lazy creation, server-id coalescing, idle eviction.
///
/// One lock covers both tables, so enqueue and eviction for the same key are
/// serialized and a merge can never interleave with either.
pub(crate) struct BucketRegistry {
    tables: Mutex<Tables>,
}

impl BucketRegistry {
    pub(crate) fn new() -> Self {
        Self { tables: Mutex::new(Tables::default()) }
    }

    /// Resolve the key to its bucket (creating it in probe state if needed)
    /// and enqueue in one step.
    pub(crate) fn enqueue(&self, key: &str, job: QueuedRequest, ctx: &Arc<Shared>) {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tables.by_route.entry(key.to_string()).or_insert_with(|| {
            debug!(bucket = key, "creating bucket in probe state");
            BucketHandle::spawn(key.to_string(), Arc::clone(ctx))
        });
        handle.enqueue(job);
    }

    /// Record the server-reported identifier for a route's bucket. When two
    /// routes report the same identifier, the later one is re-pointed at the
    /// canonical handle so their queues merge going forward; the superseded
    /// queue drains in order and is then reaped by eviction.
    pub(crate) fn observe(&self, route_key: &str, server_id: &str) {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        match tables.by_server_id.get(server_id).cloned() {
            Some(canonical) => {
                let already_merged = tables
                    .by_route
                    .get(route_key)
                    .map(|current| Arc::ptr_eq(&current.shared, &canonical.shared))
                    .unwrap_or(false);
                if !already_merged {
                    info!(
                        bucket = route_key,
                        server_bucket = server_id,
                        shared_with = %canonical.shared.key,
                        "server reports a shared bucket, coalescing queues"
                    );
                    tables.by_route.insert(route_key.to_string(), canonical);
                }
            }
            None => {
                if let Some(handle) = tables.by_route.get(route_key).cloned() {
                    tables.by_server_id.insert(server_id.to_string(), handle);
                }
            }
        }
    }

    /// Drop buckets that are empty, past their reset, and idle long enough.
    /// In-flight state is never dropped: `is_idle` requires zero outstanding
    /// requests, and runners only exit once every mapping is gone.
    pub(crate) fn evict_idle(&self, idle_after: Duration) {
        let now = Instant::now();
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.by_route.retain(|key, handle| {
            let keep = !handle.is_idle(idle_after, now);
            if !keep {
                debug!(bucket = %key, "evicting idle bucket");
            }
            keep
        });
        tables.by_server_id.retain(|_, handle| !handle.is_idle(idle_after, now));
    }

    /// Drop every mapping; runners drain what is already queued and exit.
    pub(crate) fn clear(&self) {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.by_route.clear();
        tables.by_server_id.clear();
    }

    /// One snapshot per distinct bucket (merged routes share one entry).
    pub(crate) fn snapshots(&self) -> Vec<BucketSnapshot> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let mut seen: Vec<*const ()> = Vec::new();
        let mut snapshots = Vec::new();
        for handle in tables.by_route.values() {
            let id = Arc::as_ptr(&handle.shared) as *const ();
            if !seen.contains(&id) {
                seen.push(id);
                snapshots.push(handle.snapshot());
            }
        }
        snapshots
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.snapshots().len()
    }

    pub(crate) fn queued_total(&self) -> usize {
        self.snapshots().iter().map(|snapshot| snapshot.queued).sum()
    }
}
