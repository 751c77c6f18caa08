use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::RetryPolicy;
use crate::dispatcher::Shared;
use crate::error::Error;
use crate::metrics::DispatchEvent;
use crate::request::Request;
use crate::response::{self, BucketUpdate, RawResponse, Verdict};

/// First backoff step when the server provided no delay; doubles per attempt
/// up to the configured cap.
pub(crate) const BACKOFF_BASE: Duration = Duration::from_millis(500);

pub(crate) struct QueuedRequest {
    pub request: Request,
    pub attempts: u32,
    /// Earliest dispatch time for a scheduled retry.
    pub not_before: Option<Instant>,
    pub completion: oneshot::Sender<Result<RawResponse, Error>>,
}

/// Rate-limit accounting for one bucket.
///
/// `remaining` is only trusted once `probed` is set by the first observed
/// response; before that the bucket optimistically holds a single unit so
/// the probe request can discover the real limits.
#[derive(Debug)]
pub(crate) struct BucketState {
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: Instant,
    pub probed: bool,
}

impl BucketState {
    fn new() -> Self {
        Self { remaining: 1, limit: 1, reset_at: Instant::now(), probed: false }
    }

    /// Time until the next slot, or `None` when one is available now.
    fn wait_for_slot(&self, now: Instant) -> Option<Duration> {
        if !self.probed || self.remaining > 0 || now >= self.reset_at {
            None
        } else {
            Some(self.reset_at.duration_since(now))
        }
    }

    /// Optimistically consume one slot; quota is assumed restored once the
    /// reset has passed.
    fn take_slot(&mut self, now: Instant) {
        if self.probed && now >= self.reset_at {
            self.remaining = self.limit;
        }
        self.remaining = self.remaining.saturating_sub(1);
    }

    /// Header-provided data wins over local bookkeeping.
    fn reconcile(&mut self, update: &BucketUpdate, now: Instant) {
        self.probed = true;
        if let Some(limit) = update.limit {
            self.limit = limit;
        }
        if let Some(remaining) = update.remaining {
            self.remaining = remaining;
        }
        if let Some(reset_after) = update.reset_after {
            self.reset_at = now + reset_after;
        }
    }
}

pub(crate) struct BucketShared {
    pub key: String,
    pub state: Mutex<BucketState>,
    /// Queued plus in-flight requests; eviction requires zero.
    pub outstanding: AtomicUsize,
    pub last_used: Mutex<Instant>,
}

impl BucketShared {
    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

/// Read-only view of one bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub key: String,
    pub limit: u32,
    pub remaining: u32,
    pub resets_in_ms: u64,
    pub queued: usize,
    pub probed: bool,
}

#[derive(Clone)]
pub(crate) struct BucketHandle {
    pub tx: mpsc::UnboundedSender<QueuedRequest>,
    pub shared: Arc<BucketShared>,
}

impl BucketHandle {
    /// Create the bucket in probe state and start its runner.
    pub(crate) fn spawn(key: String, ctx: Arc<Shared>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(BucketShared {
            key,
            state: Mutex::new(BucketState::new()),
            outstanding: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
        });
        tokio::spawn(run_bucket(Arc::clone(&shared), rx, ctx));
        Self { tx, shared }
    }

    pub(crate) fn enqueue(&self, job: QueuedRequest) {
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        self.shared.touch();
        if let Err(rejected) = self.tx.send(job) {
            // runner already gone; reject rather than strand the caller
            self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
            let _ = rejected.0.completion.send(Err(Error::ShuttingDown));
        }
    }

    /// Empty, quota restored, and untouched for `idle_after`.
    pub(crate) fn is_idle(&self, idle_after: Duration, now: Instant) -> bool {
        if self.shared.outstanding.load(Ordering::SeqCst) != 0 {
            return false;
        }
        {
            let state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.probed && now < state.reset_at {
                return false;
            }
        }
        let last_used = *self.shared.last_used.lock().unwrap_or_else(PoisonError::into_inner);
        now.duration_since(last_used) >= idle_after
    }

    pub(crate) fn snapshot(&self) -> BucketSnapshot {
        let state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        BucketSnapshot {
            key: self.shared.key.clone(),
            limit: state.limit,
            remaining: state.remaining,
            resets_in_ms: state.reset_at.duration_since(now).as_millis() as u64,
            queued: self.shared.outstanding.load(Ordering::SeqCst),
            probed: state.probed,
        }
    }
}

/// Exponential backoff for the given attempt number (1-based), capped.
pub(crate) fn backoff(attempt: u32, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    BACKOFF_BASE.saturating_mul(1u32 << exponent).min(cap)
}

fn finish(bucket: &BucketShared, job: QueuedRequest, result: Result<RawResponse, Error>) {
    bucket.outstanding.fetch_sub(1, Ordering::SeqCst);
    bucket.touch();
    if job.completion.send(result).is_err() {
        // caller dropped the handle; state was still reconciled above
        trace!(bucket = %bucket.key, "pending call cancelled, result discarded");
    }
}

/// Place a retry according to policy: either run it next (ahead of anything
/// newer) or behind requests that arrived while the retry was pending.
fn requeue_for_retry(
    policy: RetryPolicy,
    pending: &mut VecDeque<QueuedRequest>,
    rx: &mut mpsc::UnboundedReceiver<QueuedRequest>,
    job: QueuedRequest,
) -> Option<QueuedRequest> {
    match policy {
        RetryPolicy::RetryFirst => Some(job),
        RetryPolicy::Fair => {
            while let Ok(newer) = rx.try_recv() {
                pending.push_back(newer);
            }
            pending.push_back(job);
            None
        }
    }
}

/// Per-bucket runner: strictly sequential execution of the bucket's queue,
/// which is what guarantees per-route ordering and keeps dispatches within
/// `remaining`. All waits are timer wake-ups; other buckets keep running.
pub(crate) async fn run_bucket(
    bucket: Arc<BucketShared>,
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
    ctx: Arc<Shared>,
) {
    let mut pending: VecDeque<QueuedRequest> = VecDeque::new();
    'next: loop {
        let mut job = match pending.pop_front() {
            Some(job) => job,
            None => match rx.recv().await {
                Some(job) => job,
                None => break,
            },
        };

        'attempt: loop {
            // queued work is rejected on shutdown, never dispatched
            if ctx.is_shutdown() {
                finish(&bucket, job, Err(Error::ShuttingDown));
                continue 'next;
            }

            let now = Instant::now();
            if let Some(at) = job.not_before {
                if now < at {
                    ctx.wait(at.duration_since(now)).await;
                    continue 'attempt;
                }
                job.not_before = None;
            }

            // breaker gate: requests stay queued while tripped
            if let Some(cooldown) = ctx.breaker.cooldown() {
                debug!(
                    bucket = %bucket.key,
                    wait_ms = cooldown.as_millis() as u64,
                    "invalid request breaker tripped, holding dispatch"
                );
                ctx.wait(cooldown).await;
                continue 'attempt;
            }

            // bucket quota gate; nothing is consumed while waiting
            let slot_wait = {
                let state = bucket.state.lock().unwrap_or_else(PoisonError::into_inner);
                state.wait_for_slot(now)
            };
            if let Some(wait) = slot_wait {
                trace!(
                    bucket = %bucket.key,
                    wait_ms = wait.as_millis() as u64,
                    "bucket quota exhausted, waiting for reset"
                );
                ctx.wait(wait).await;
                continue 'attempt;
            }

            // global gate, charged per attempt
            if let Err(wait) = ctx.global.acquire() {
                debug!(
                    bucket = %bucket.key,
                    wait_ms = wait.as_millis() as u64,
                    "global ceiling reached, waiting"
                );
                ctx.wait(wait).await;
                continue 'attempt;
            }

            {
                let mut state = bucket.state.lock().unwrap_or_else(PoisonError::into_inner);
                state.take_slot(Instant::now());
            }

            job.attempts += 1;
            let attempt = job.attempts;
            trace!(bucket = %bucket.key, path = %job.request.path, attempt, "dispatching");
            ctx.metrics.record(&bucket.key, DispatchEvent::Dispatched).await;

            match ctx.transport.send(&job.request).await {
                Err(err) => {
                    if attempt > ctx.config.max_retries {
                        ctx.metrics.record(&bucket.key, DispatchEvent::Failed).await;
                        finish(
                            &bucket,
                            job,
                            Err(Error::RetryExhausted { attempts: attempt, last: Box::new(err) }),
                        );
                        continue 'next;
                    }
                    let delay = backoff(attempt, ctx.config.max_backoff);
                    debug!(
                        bucket = %bucket.key,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "transport failure, retrying"
                    );
                    ctx.metrics.record(&bucket.key, DispatchEvent::Retried).await;
                    job.not_before = Some(Instant::now() + delay);
                    match requeue_for_retry(ctx.config.retry_policy, &mut pending, &mut rx, job) {
                        Some(retry) => {
                            job = retry;
                            continue 'attempt;
                        }
                        None => continue 'next,
                    }
                }
                Ok(raw) => {
                    let classified = response::classify(&raw);
                    let now = Instant::now();

                    if let Some(update) = &classified.bucket {
                        {
                            let mut state =
                                bucket.state.lock().unwrap_or_else(PoisonError::into_inner);
                            state.reconcile(update, now);
                        }
                        if let Some(server_id) = &update.bucket_id {
                            ctx.registry.observe(&bucket.key, server_id);
                        }
                    }
                    if let Some(pause) = classified.global {
                        ctx.global.freeze(pause);
                    }
                    if classified.invalid {
                        ctx.metrics.record(&bucket.key, DispatchEvent::Invalid).await;
                        ctx.breaker.record_invalid();
                    }

                    match classified.verdict {
                        Verdict::Success => {
                            ctx.metrics.record(&bucket.key, DispatchEvent::Succeeded).await;
                            finish(&bucket, job, Ok(raw));
                            continue 'next;
                        }
                        Verdict::Terminal(error) => {
                            debug!(bucket = %bucket.key, error = %error, "terminal response");
                            ctx.metrics.record(&bucket.key, DispatchEvent::Failed).await;
                            finish(&bucket, job, Err(error));
                            continue 'next;
                        }
                        Verdict::Retry { error, delay } => {
                            if attempt > ctx.config.max_retries {
                                ctx.metrics.record(&bucket.key, DispatchEvent::Failed).await;
                                finish(
                                    &bucket,
                                    job,
                                    Err(Error::RetryExhausted {
                                        attempts: attempt,
                                        last: Box::new(error),
                                    }),
                                );
                                continue 'next;
                            }
                            let delay =
                                delay.unwrap_or_else(|| backoff(attempt, ctx.config.max_backoff));
                            debug!(
                                bucket = %bucket.key,
                                attempt,
                                error = %error,
                                delay_ms = delay.as_millis() as u64,
                                "retryable response, re-dispatching after delay"
                            );
                            ctx.metrics.record(&bucket.key, DispatchEvent::Retried).await;
                            job.not_before = Some(Instant::now() + delay);
                            match requeue_for_retry(
                                ctx.config.retry_policy,
                                &mut pending,
                                &mut rx,
                                job,
                            ) {
                                Some(retry) => {
                                    job = retry;
                                    continue 'attempt;
                                }
                                None => continue 'next,
                            }
                        }
                    }
                }
            }
        }
    }
    trace!(bucket = %bucket.key, "bucket runner exited");
}
