use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug)]
struct WindowState {
    count: u64,
    window_start: Instant,
    tripped: bool,
    trip_until: Instant,
}

/// Rolling-window circuit breaker over invalid responses (401/403/429).
///
/// Too many invalid requests risk a server-side ban that would hit every
/// bucket at once, so once the threshold is crossed the whole dispatcher
/// holds until the window ends. Queued requests stay queued.
#[derive(Debug)]
pub(crate) struct InvalidRequestTracker {
    threshold: u64,
    window: Duration,
    state: Mutex<WindowState>,
}

impl InvalidRequestTracker {
    pub(crate) fn new(threshold: u64, window: Duration) -> Self {
        let now = Instant::now();
        Self {
            threshold,
            window,
            state: Mutex::new(WindowState {
                count: 0,
                window_start: now,
                tripped: false,
                trip_until: now,
            }),
        }
    }

    pub(crate) fn record_invalid(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if now >= state.window_start + self.window {
            state.window_start = now;
            state.count = 0;
            state.tripped = false;
        }
        state.count += 1;
        if !state.tripped && state.count > self.threshold {
            state.tripped = true;
            state.trip_until = state.window_start + self.window;
            warn!(
                count = state.count,
                threshold = self.threshold,
                "invalid request threshold exceeded, suspending all dispatch"
            );
        }
    }

    /// Remaining cool-down when tripped; `None` means dispatch may proceed.
    pub(crate) fn cooldown(&self) -> Option<Duration> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.tripped {
            return None;
        }
        let now = Instant::now();
        if now >= state.trip_until {
            state.tripped = false;
            state.count = 0;
            state.window_start = now;
            info!("invalid request breaker cool-down elapsed, dispatch resumed");
            return None;
        }
        Some(state.trip_until.duration_since(now))
    }

    pub(crate) fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        BreakerSnapshot {
            count: state.count,
            tripped: state.tripped && now < state.trip_until,
            resumes_in_ms: if state.tripped {
                state.trip_until.duration_since(now).as_millis() as u64
            } else {
                0
            },
        }
    }
}

/// Read-only view of the invalid-request breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub count: u64,
    pub tripped: bool,
    pub resumes_in_ms: u64,
}
