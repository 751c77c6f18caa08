use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything a dispatched request can fail with.
///
/// Retryable kinds are consumed by the dispatch loop and only surface once
/// the retry budget is spent; terminal kinds reject the caller's
/// [`PendingCall`](crate::PendingCall) directly.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The transport failed before an HTTP status was produced.
    #[error("transport error: {0}")]
    Network(String),

    /// The server answered 429 for this bucket.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// The server answered 429 with the global flag set; all buckets pause.
    #[error("globally rate limited, retry after {retry_after:?}")]
    GlobalRateLimited { retry_after: Duration },

    /// 5xx response.
    #[error("server error: status {status}")]
    Server { status: u16 },

    /// Any 4xx other than 429.
    #[error("request rejected: status {status}")]
    Client { status: u16 },

    /// The retry budget ran out; `last` preserves the final retryable error.
    #[error("retry budget exhausted after {attempts} attempts")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    /// The dispatcher is shutting down; the request was never dispatched.
    #[error("dispatcher is shutting down")]
    ShuttingDown,

    /// Rejected configuration at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Kinds the dispatch loop handles internally by waiting and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::RateLimited { .. }
                | Error::GlobalRateLimited { .. }
                | Error::Server { .. }
        )
    }
}
