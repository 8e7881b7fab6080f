//! Transport operation contract.
//!
//! The dispatcher never talks to the network itself. Callers hand it an
//! operation that produces a [`TransportResponse`] (status, headers, body),
//! and the dispatcher only ever looks at the status and headers.

mod http;

pub use http::{HttpRequest, HttpTransport};

use std::collections::HashMap;
use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;

/// Errors raised by a transport operation before a response was obtained.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Network-level failure (timeout, connection reset, DNS). Retried.
    #[error("network error: {0}")]
    Network(String),
    /// Failure that will not go away by retrying (bad URL, invalid proxy).
    #[error("{0}")]
    Fatal(String),
}

impl TransportError {
    /// Whether the dispatcher may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Network(_))
    }
}

/// One upstream response as seen by the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    /// Response headers. Lookups through [`TransportResponse::header`] are case-insensitive.
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl TransportResponse {
    /// Create a response with no headers and no body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Add a header (builder style).
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Case-insensitive lookup in a header map.
pub fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers.get(name).map(|s| s.as_str()).or_else(|| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    })
}

/// Result of one transport call.
pub type TransportResult = Result<TransportResponse, TransportError>;

/// A re-invocable transport operation. Retries call it again.
pub type Operation = std::sync::Arc<dyn Fn() -> BoxFuture<'static, TransportResult> + Send + Sync>;

/// Wrap an async closure as an [`Operation`].
pub fn operation<F, Fut>(f: F) -> Operation
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TransportResult> + Send + 'static,
{
    std::sync::Arc::new(move || f().boxed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_ignores_case() {
        let mut headers = HashMap::new();
        headers.insert("X-RateLimit-Remaining".to_string(), "7".to_string());
        let response = TransportResponse {
            status: 200,
            headers,
            body: None,
        };
        assert_eq!(response.header("x-ratelimit-remaining"), Some("7"));
        assert_eq!(response.header("X-RATELIMIT-REMAINING"), Some("7"));
        assert_eq!(response.header("retry-after"), None);
    }

    #[test]
    fn test_retryable_split() {
        assert!(TransportError::Network("reset".into()).is_retryable());
        assert!(!TransportError::Fatal("bad url".into()).is_retryable());
    }
}
