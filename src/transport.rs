use async_trait::async_trait;

use crate::error::Error;
use crate::request::Request;
use crate::response::RawResponse;

/// The network boundary the dispatcher drives.
///
/// Implementations own the actual HTTP exchange (client, TLS, pooling) and
/// report transport-level failures as [`Error::Network`], distinct from any
/// HTTP status. The dispatcher never inspects the body; it only reads the
/// status and rate-limit headers.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &Request) -> Result<RawResponse, Error>;
}
