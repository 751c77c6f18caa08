use std::collections::HashMap;
use std::time::Duration;

use crate::error::Error;

pub(crate) const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub(crate) const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub(crate) const HEADER_RESET_AFTER: &str = "X-RateLimit-Reset-After";
pub(crate) const HEADER_BUCKET: &str = "X-RateLimit-Bucket";
pub(crate) const HEADER_GLOBAL: &str = "X-RateLimit-Global";
pub(crate) const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Fallback pause for a global 429 that carried no retry-after.
const GLOBAL_FALLBACK: Duration = Duration::from_secs(1);

/// What the transport handed back: status, headers, body bytes.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: u16) -> Self {
        Self { status, headers: HashMap::new(), body: Vec::new() }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        self.status < 400
    }
}

/// Rate-limit state carried in response headers. Always authoritative over
/// local bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BucketUpdate {
    pub remaining: Option<u32>,
    pub limit: Option<u32>,
    pub reset_after: Option<Duration>,
    pub bucket_id: Option<String>,
}

impl BucketUpdate {
    fn is_empty(&self) -> bool {
        self.remaining.is_none()
            && self.limit.is_none()
            && self.reset_after.is_none()
            && self.bucket_id.is_none()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Verdict {
    Success,
    /// Retry after `delay`; `None` means the caller picks an exponential
    /// backoff because the server gave no delay.
    Retry { error: Error, delay: Option<Duration> },
    Terminal(Error),
}

/// A fully classified response, ready for the dispatch loop to act on.
#[derive(Debug, Clone)]
pub(crate) struct Classified {
    pub bucket: Option<BucketUpdate>,
    /// Set when the global flag was present: how long to freeze all dispatch.
    pub global: Option<Duration>,
    /// Counts toward the invalid-request breaker (401/403/429).
    pub invalid: bool,
    pub verdict: Verdict,
}

pub(crate) fn classify(response: &RawResponse) -> Classified {
    let update = bucket_update(response);
    let retry_after = duration_header(response, HEADER_RETRY_AFTER);
    let status = response.status;

    match status {
        status if status < 400 => Classified {
            bucket: update,
            global: None,
            invalid: false,
            verdict: Verdict::Success,
        },
        429 => {
            let is_global = response
                .header(HEADER_GLOBAL)
                .map(|value| value.eq_ignore_ascii_case("true"))
                .unwrap_or(false);
            if is_global {
                let pause = retry_after.unwrap_or(GLOBAL_FALLBACK);
                Classified {
                    // the update belongs to the global limiter, not the bucket
                    bucket: None,
                    global: Some(pause),
                    invalid: true,
                    verdict: Verdict::Retry {
                        error: Error::GlobalRateLimited { retry_after: pause },
                        delay: Some(pause),
                    },
                }
            } else {
                Classified {
                    bucket: update,
                    global: None,
                    invalid: true,
                    verdict: Verdict::Retry {
                        error: Error::RateLimited {
                            retry_after: retry_after.unwrap_or_default(),
                        },
                        delay: retry_after,
                    },
                }
            }
        }
        401 | 403 => Classified {
            bucket: update,
            global: None,
            invalid: true,
            verdict: Verdict::Terminal(Error::Client { status }),
        },
        status if status >= 500 => Classified {
            bucket: update,
            global: None,
            invalid: false,
            verdict: Verdict::Retry { error: Error::Server { status }, delay: None },
        },
        _ => Classified {
            bucket: update,
            global: None,
            invalid: false,
            verdict: Verdict::Terminal(Error::Client { status }),
        },
    }
}

fn bucket_update(response: &RawResponse) -> Option<BucketUpdate> {
    let update = BucketUpdate {
        remaining: response.header(HEADER_REMAINING).and_then(|v| v.parse().ok()),
        limit: response.header(HEADER_LIMIT).and_then(|v| v.parse().ok()),
        reset_after: duration_header(response, HEADER_RESET_AFTER),
        bucket_id: response.header(HEADER_BUCKET).map(str::to_string),
    };
    if update.is_empty() {
        None
    } else {
        Some(update)
    }
}

/// Fractional seconds; malformed or negative values are ignored.
fn duration_header(response: &RawResponse, name: &str) -> Option<Duration> {
    response
        .header(name)
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}
