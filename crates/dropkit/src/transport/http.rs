//! `reqwest` adapter implementing the transport contract for one egress identity.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Client, Method, Proxy, Response};
use tracing::debug;

use super::{operation, Operation, TransportError, TransportResponse, TransportResult};
use crate::egress::EgressIdentity;

/// Default user agent for upstream requests.
pub const USER_AGENT: &str = concat!("dropkit/", env!("CARGO_PKG_VERSION"));

/// A request description that can be replayed on every retry.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add every header of a map (e.g. conditional request headers).
    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }
}

fn extract_response_headers(response: &Response) -> HashMap<String, String> {
    response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_builder() {
        TransportError::Fatal(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}

/// HTTP transport bound to a single egress identity.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    identity: EgressIdentity,
}

impl HttpTransport {
    /// Build a client that routes every request through `identity`.
    pub fn new(
        identity: EgressIdentity,
        timeout: Duration,
        user_agent: Option<&str>,
    ) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .user_agent(user_agent.unwrap_or(USER_AGENT))
            .timeout(timeout)
            .gzip(true)
            .brotli(true);

        match &identity {
            EgressIdentity::Direct => {}
            EgressIdentity::Proxy(endpoint) => {
                let proxy = Proxy::all(endpoint.url()).map_err(|e| {
                    TransportError::Fatal(format!("Invalid proxy URL '{}': {}", endpoint, e))
                })?;
                builder = builder.proxy(proxy);
            }
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Fatal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, identity })
    }

    pub fn identity(&self) -> &EgressIdentity {
        &self.identity
    }

    /// Send one request and collect status, headers and body.
    pub async fn send(&self, request: HttpRequest) -> TransportResult {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = extract_response_headers(&response);
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        debug!(
            "{} {} via {} -> {}",
            request.method, request.url, self.identity, status
        );

        Ok(TransportResponse {
            status,
            headers,
            body: if body.is_empty() {
                None
            } else {
                Some(body.to_vec())
            },
        })
    }

    /// Wrap a request as a replayable dispatcher operation.
    pub fn operation(&self, request: HttpRequest) -> Operation {
        let transport = self.clone();
        operation(move || {
            let transport = transport.clone();
            let request = request.clone();
            async move { transport.send(request).await }
        })
    }
}
