use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a retried request interleaves with requests submitted while the retry
/// was waiting out its delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// The retried request runs strictly before anything submitted after the
    /// retry decision.
    #[default]
    RetryFirst,
    /// Requests that arrived while the retry was pending go first.
    Fair,
}

/// Dispatcher configuration.
///
/// All fields have working defaults; durations deserialize from humantime
/// strings (`"10m"`, `"500ms"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Retries allowed per request beyond the initial attempt.
    pub max_retries: u32,
    /// Invalid responses (401/403/429) tolerated per window before the
    /// breaker suspends all dispatch.
    pub invalid_request_threshold: u64,
    /// Rolling window the invalid-request count is measured over.
    #[serde(with = "humantime_serde")]
    pub invalid_request_window: Duration,
    /// Ceiling for exponential backoff when the server gave no delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// How long a drained bucket may sit idle before eviction.
    #[serde(with = "humantime_serde")]
    pub idle_bucket_eviction: Duration,
    /// Process-wide request ceiling per global window.
    pub global_limit: u32,
    /// Window the global ceiling applies to.
    #[serde(with = "humantime_serde")]
    pub global_window: Duration,
    /// Retry-vs-new interleaving policy, see [`RetryPolicy`].
    pub retry_policy: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: 5,
            invalid_request_threshold: 10_000,
            invalid_request_window: Duration::from_secs(600),
            max_backoff: Duration::from_secs(60),
            idle_bucket_eviction: Duration::from_secs(60),
            global_limit: 50,
            global_window: Duration::from_secs(1),
            retry_policy: RetryPolicy::RetryFirst,
        }
    }
}

impl Config {
    /// Validate parameters before the dispatcher starts.
    pub fn validate(&self) -> Result<(), String> {
        if self.invalid_request_threshold == 0 {
            return Err("invalid request threshold must be greater than 0".to_string());
        }
        if self.invalid_request_window.is_zero() {
            return Err("invalid request window must be greater than 0".to_string());
        }
        if self.max_backoff.is_zero() {
            return Err("max backoff must be greater than 0".to_string());
        }
        if self.idle_bucket_eviction.is_zero() {
            return Err("idle bucket eviction must be greater than 0".to_string());
        }
        if self.global_limit == 0 {
            return Err("global limit must be greater than 0".to_string());
        }
        if self.global_window.is_zero() {
            return Err("global window must be greater than 0".to_string());
        }
        Ok(())
    }
}
