use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::info;

use crate::breaker::{BreakerSnapshot, InvalidRequestTracker};
use crate::bucket::{BucketSnapshot, QueuedRequest};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::global::{GlobalLimiter, GlobalSnapshot};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::registry::BucketRegistry;
use crate::request::Request;
use crate::response::RawResponse;
use crate::transport::Transport;

/// State shared between the dispatcher facade and every bucket runner.
///
/// The limiter and breaker are single owned instances handed to runners by
/// reference; nothing here is ambient.
pub(crate) struct Shared {
    pub config: Config,
    pub transport: Arc<dyn Transport>,
    pub global: GlobalLimiter,
    pub breaker: InvalidRequestTracker,
    pub registry: BucketRegistry,
    pub metrics: MetricsCollector,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

impl Shared {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Timed suspension that also wakes early on shutdown. Callers re-check
    /// their gates after waking, so a spurious wake is harmless.
    pub(crate) async fn wait(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown_notify.notified() => {}
        }
    }
}

/// Handle to a queued or in-flight request.
///
/// Resolves with the response once the request clears its bucket, or with a
/// terminal [`Error`]. Dropping the handle cancels interest: an in-flight
/// request is not aborted, its result is discarded, and rate-limit state is
/// still reconciled from the response.
pub struct PendingCall {
    rx: oneshot::Receiver<Result<RawResponse>>,
}

impl PendingCall {
    fn ready(result: Result<RawResponse>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for PendingCall {
    type Output = Result<RawResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            // the runner was torn down before resolving this call
            Err(_) => Err(Error::ShuttingDown),
        })
    }
}

/// Overall dispatcher health for observability endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherHealth {
    pub accepting: bool,
    pub breaker_tripped: bool,
    pub buckets: usize,
    pub queued: usize,
}

/// Public entry point: resolves requests to buckets, queues them, and drives
/// dispatch through the caller-supplied transport.
pub struct Dispatcher {
    inner: Arc<Shared>,
    sweeper: JoinHandle<()>,
}

impl Dispatcher {
    /// Must be called from within a tokio runtime; bucket runners and the
    /// eviction sweeper are spawned onto it.
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate().map_err(Error::Config)?;

        let global = GlobalLimiter::new(config.global_limit, config.global_window);
        let breaker = InvalidRequestTracker::new(
            config.invalid_request_threshold,
            config.invalid_request_window,
        );
        let inner = Arc::new(Shared {
            global,
            breaker,
            registry: BucketRegistry::new(),
            metrics: MetricsCollector::new(),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            transport,
            config,
        });
        let sweeper = tokio::spawn(sweep_idle(Arc::clone(&inner)));

        info!(
            global_limit = inner.config.global_limit,
            max_retries = inner.config.max_retries,
            "dispatcher started"
        );
        Ok(Self { inner, sweeper })
    }

    /// Queue a request on its bucket and return immediately.
    ///
    /// Requests sharing a bucket key complete in submission order; distinct
    /// buckets proceed independently up to the global ceiling.
    pub fn submit(&self, request: Request) -> PendingCall {
        if self.inner.is_shutdown() {
            return PendingCall::ready(Err(Error::ShuttingDown));
        }
        let key = request.bucket_key();
        let (tx, rx) = oneshot::channel();
        let job = QueuedRequest { request, attempts: 0, not_before: None, completion: tx };
        self.inner.registry.enqueue(&key, job, &self.inner);
        PendingCall { rx }
    }

    /// Stop accepting work: in-flight requests drain and resolve normally,
    /// queued ones are rejected with [`Error::ShuttingDown`], and later
    /// `submit` calls resolve the same way.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("dispatcher shutting down, draining in-flight requests");
        self.inner.shutdown_notify.notify_waiters();
        self.sweeper.abort();
        self.inner.registry.clear();
    }

    pub fn buckets(&self) -> Vec<BucketSnapshot> {
        self.inner.registry.snapshots()
    }

    pub fn global(&self) -> GlobalSnapshot {
        self.inner.global.snapshot()
    }

    pub fn breaker(&self) -> BreakerSnapshot {
        self.inner.breaker.snapshot()
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot().await
    }

    pub async fn bucket_metrics(&self, key: &str) -> Option<crate::metrics::BucketMetrics> {
        self.inner.metrics.bucket(key).await
    }

    pub fn health(&self) -> DispatcherHealth {
        DispatcherHealth {
            accepting: !self.inner.is_shutdown(),
            breaker_tripped: self.inner.breaker.snapshot().tripped,
            buckets: self.inner.registry.bucket_count(),
            queued: self.inner.registry.queued_total(),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Periodically reap buckets that drained and went idle.
async fn sweep_idle(ctx: Arc<Shared>) {
    let mut interval = tokio::time::interval(ctx.config.idle_bucket_eviction);
    loop {
        interval.tick().await;
        if ctx.is_shutdown() {
            break;
        }
        ctx.registry.evict_idle(ctx.config.idle_bucket_eviction);
    }
}
