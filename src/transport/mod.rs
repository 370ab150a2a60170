//! Outbound HTTP transport: the seam between the engine and the network
//!
//! Deliveries and HTTP integrations build an `OutboundRequest` and hand it
//! to an `HttpTransport`. Production uses `ReqwestTransport`; tests inject
//! a recording transport with scripted responses.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::time::Duration;
use thiserror::Error;

mod http;

pub use http::ReqwestTransport;

/// A fully built outbound request
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Duration,
    /// Stop reading the response body after this many bytes (`None` reads it all)
    pub max_response_bytes: Option<usize>,
}

impl OutboundRequest {
    /// JSON POST with no extra headers
    pub fn post(url: impl Into<String>, body: impl Into<Bytes>, timeout: Duration) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: HeaderMap::new(),
            body: body.into(),
            timeout,
            max_response_bytes: None,
        }
    }

    pub fn with_max_response_bytes(mut self, limit: usize) -> Self {
        self.max_response_bytes = Some(limit);
        self
    }

    /// Look up a header value as a string
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Status and body of a completed exchange, whatever the status code
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failures that prevented any HTTP response from being received
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),

    #[error("Request failed: {0}")]
    Request(String),
}

/// Trait for outbound HTTP backends
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform one request; non-2xx statuses are responses, not errors
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError>;

    /// Transport name (e.g., "reqwest", "mock")
    fn name(&self) -> &str;
}
