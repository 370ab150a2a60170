//! reqwest-backed transport

use super::{HttpTransport, OutboundRequest, TransportError, TransportResponse};
use crate::error::{Result, WebhookError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::time::Duration;

/// `HttpTransport` over a shared `reqwest::Client`
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport with its own connection pool
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| WebhookError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Wrap an existing client (shared pool, custom TLS, proxies)
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        request: OutboundRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let timeout = request.timeout;
        let limit = request.max_response_bytes;
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", request.url, e)))?;

        let response = self
            .client
            .request(request.method, url)
            .headers(request.headers)
            .body(request.body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status().as_u16();
        let body = read_body(response, limit, timeout).await?;

        Ok(TransportResponse { status, body })
    }

    fn name(&self) -> &str {
        "reqwest"
    }
}

/// Read at most `limit` bytes; the rest is discarded with the connection
async fn read_body(
    mut response: reqwest::Response,
    limit: Option<usize>,
    timeout: Duration,
) -> std::result::Result<Bytes, TransportError> {
    let Some(limit) = limit else {
        return response.bytes().await.map_err(|e| classify(e, timeout));
    };

    let mut body = BytesMut::with_capacity(limit.min(8 * 1024));
    while body.len() < limit {
        match response.chunk().await.map_err(|e| classify(e, timeout))? {
            Some(chunk) => {
                let take = chunk.len().min(limit - body.len());
                body.extend_from_slice(&chunk[..take]);
            }
            None => break,
        }
    }
    Ok(body.freeze())
}

fn classify(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_connect() {
        TransportError::Connect(error_chain(&err))
    } else if err.is_builder() {
        TransportError::InvalidUrl(error_chain(&err))
    } else {
        TransportError::Request(error_chain(&err))
    }
}

/// reqwest's top-level message hides the cause (DNS, refused, TLS)
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
