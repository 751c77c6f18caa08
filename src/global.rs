use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug)]
struct GlobalState {
    remaining: u32,
    reset_at: Instant,
}

/// Process-wide ceiling shared by every bucket.
///
/// Charged once per dispatch attempt, successful or not, since the server
/// counts the attempt either way.
#[derive(Debug)]
pub(crate) struct GlobalLimiter {
    limit: u32,
    window: Duration,
    state: Mutex<GlobalState>,
}

impl GlobalLimiter {
    pub(crate) fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(GlobalState { remaining: limit, reset_at: Instant::now() + window }),
        }
    }

    /// Charge one attempt. `Err` carries how long every bucket must wait
    /// before dispatching again.
    pub(crate) fn acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if now >= state.reset_at {
            state.remaining = self.limit;
            state.reset_at = now + self.window;
        }
        if state.remaining == 0 {
            return Err(state.reset_at.duration_since(now));
        }
        state.remaining -= 1;
        Ok(())
    }

    /// A response carried the global flag; server accounting overrides ours.
    pub(crate) fn freeze(&self, retry_after: Duration) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.remaining = 0;
        state.reset_at = Instant::now() + retry_after;
        warn!(
            retry_after_ms = retry_after.as_millis() as u64,
            "global rate limit exceeded, pausing all dispatch"
        );
    }

    pub(crate) fn snapshot(&self) -> GlobalSnapshot {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        GlobalSnapshot {
            limit: self.limit,
            remaining: if now >= state.reset_at { self.limit } else { state.remaining },
            resets_in_ms: state.reset_at.duration_since(now).as_millis() as u64,
        }
    }
}

/// Read-only view of the global ceiling.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalSnapshot {
    pub limit: u32,
    pub remaining: u32,
    pub resets_in_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_the_wait_until_reset() {
        let limiter = GlobalLimiter::new(2, Duration::from_secs(1));
        assert!(limiter.acquire().is_ok());
        assert!(limiter.acquire().is_ok());

        let wait = limiter.acquire().expect_err("ceiling should be hit");
        assert!(wait <= Duration::from_secs(1));
        assert!(wait > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_restores_after_the_window() {
        let limiter = GlobalLimiter::new(1, Duration::from_secs(1));
        assert!(limiter.acquire().is_ok());
        assert!(limiter.acquire().is_err());

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(limiter.acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn freeze_overrides_local_accounting() {
        let limiter = GlobalLimiter::new(10, Duration::from_secs(1));
        assert!(limiter.acquire().is_ok());

        limiter.freeze(Duration::from_secs(5));
        let wait = limiter.acquire().expect_err("frozen limiter must refuse");
        assert!(wait > Duration::from_secs(4));

        tokio::time::advance(Duration::from_millis(5100)).await;
        assert!(limiter.acquire().is_ok());
    }
}
