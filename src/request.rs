use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Routes without a major parameter all share this marker in their key.
const NO_MAJOR: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single outgoing API call.
///
/// `route` is the parameterized template (`/channels/{id}/messages`) that the
/// server buckets by; `path` is the resolved path the transport sends. The
/// major parameter (e.g. a channel or guild id) partitions the bucket; routes
/// without one share a per-route bucket.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub route: String,
    pub path: String,
    pub major: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, route: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            route: route.into(),
            path: path.into(),
            major: None,
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Set the major parameter that partitions this route's bucket.
    pub fn with_major(mut self, id: impl Into<String>) -> Self {
        self.major = Some(id.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Key the registry buckets by. Two requests share a queue iff their
    /// keys are equal.
    pub(crate) fn bucket_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.method.as_str(),
            self.route,
            self.major.as_deref().unwrap_or(NO_MAJOR)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_route_and_major_share_a_key() {
        let a = Request::new(Method::Post, "/channels/{id}/messages", "/channels/11/messages")
            .with_major("11");
        let b = Request::new(Method::Post, "/channels/{id}/messages", "/channels/11/messages")
            .with_major("11");
        assert_eq!(a.bucket_key(), b.bucket_key());
    }

    #[test]
    fn method_major_and_route_all_partition() {
        let base = Request::new(Method::Post, "/channels/{id}/messages", "/channels/11/messages")
            .with_major("11");
        let other_major = Request::new(Method::Post, "/channels/{id}/messages", "/channels/22/messages")
            .with_major("22");
        let other_method = Request::new(Method::Get, "/channels/{id}/messages", "/channels/11/messages")
            .with_major("11");
        let other_route = Request::new(Method::Post, "/channels/{id}/pins", "/channels/11/pins")
            .with_major("11");

        assert_ne!(base.bucket_key(), other_major.bucket_key());
        assert_ne!(base.bucket_key(), other_method.bucket_key());
        assert_ne!(base.bucket_key(), other_route.bucket_key());
    }

    #[test]
    fn routes_without_a_major_use_the_sentinel() {
        let a = Request::new(Method::Get, "/gateway", "/gateway");
        let b = Request::new(Method::Get, "/gateway", "/gateway");
        assert_eq!(a.bucket_key(), b.bucket_key());
        assert!(a.bucket_key().ends_with(":-"));
    }
}
