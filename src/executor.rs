//! Single-attempt HTTP delivery
//!
//! `DeliveryExecutor` turns an event into the canonical JSON payload,
//! attaches the standard and subscription headers plus an optional HMAC
//! signature, and performs one request through the `HttpTransport`.
//! It never returns an error: every outcome, network failures included,
//! is reported as an `AttemptOutcome`.

use crate::signer;
use crate::transport::{HttpTransport, OutboundRequest, TransportResponse};
use crate::types::{Delivery, Event, Subscription};
use bytes::Bytes;
use chrono::SecondsFormat;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const HEADER_EVENT_TYPE: &str = "x-event-type";
pub const HEADER_DELIVERY_ID: &str = "x-delivery-id";
pub const HEADER_SIGNATURE: &str = "x-signature";

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RESPONSE_BODY_LIMIT: usize = 1000;
pub const DEFAULT_USER_AGENT_PRODUCT: &str = "A3S";

/// Wire payload POSTed to subscribers
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload<'a> {
    pub id: &'a str,

    #[serde(rename = "type")]
    pub event_type: &'a str,

    pub data: &'a Value,

    /// RFC 3339 with millisecond precision and `Z`
    pub timestamp: String,

    pub source: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<&'a Map<String, Value>>,
}

impl<'a> WebhookPayload<'a> {
    pub fn from_event(event: &'a Event) -> Self {
        Self {
            id: &event.id,
            event_type: &event.event_type,
            data: &event.data,
            timestamp: event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            source: &event.source,
            user_id: event.user_id.as_deref(),
            session_id: event.session_id.as_deref(),
            metadata: event.metadata.as_ref(),
        }
    }
}

/// Serialize an event into the exact bytes that are sent and signed
pub fn payload_bytes(event: &Event) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&WebhookPayload::from_event(event))
}

/// Result of one HTTP attempt
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    pub success: bool,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl AttemptOutcome {
    fn failed(error: String, duration_ms: u64) -> Self {
        Self {
            success: false,
            status_code: None,
            response_body: None,
            error: Some(error),
            duration_ms,
        }
    }
}

/// Performs individual delivery attempts
pub struct DeliveryExecutor {
    transport: Arc<dyn HttpTransport>,
    timeout: Duration,
    user_agent: String,
    body_limit: usize,
}

impl DeliveryExecutor {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            user_agent: user_agent_for(DEFAULT_USER_AGENT_PRODUCT),
            body_limit: DEFAULT_RESPONSE_BODY_LIMIT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the product name used in `User-Agent: <product>-Webhook/1.0`
    pub fn with_user_agent_product(mut self, product: &str) -> Self {
        self.user_agent = user_agent_for(product);
        self
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Deliver the delivery's event snapshot to its URL snapshot
    ///
    /// Secret and custom headers come from the subscription as it is now.
    pub async fn attempt(
        &self,
        subscription: &Subscription,
        delivery: &Delivery,
    ) -> AttemptOutcome {
        let body = match payload_bytes(&delivery.event) {
            Ok(body) => body,
            Err(e) => {
                return AttemptOutcome::failed(format!("Failed to serialize payload: {}", e), 0)
            }
        };

        // Identity and signature headers go last; custom headers cannot replace them
        let mut headers = self.default_headers();
        apply_custom_headers(&mut headers, &subscription.headers);
        insert_header(&mut headers, HEADER_EVENT_TYPE, &delivery.event_type);
        insert_header(&mut headers, HEADER_DELIVERY_ID, &delivery.id);
        headers.remove(HEADER_SIGNATURE);
        if let Some(secret) = subscription.secret.as_deref() {
            insert_header(&mut headers, HEADER_SIGNATURE, &signer::sign(&body, secret));
        }

        tracing::debug!(
            delivery_id = %delivery.id,
            subscription_id = %subscription.id,
            url = %delivery.url,
            "Sending webhook"
        );
        self.execute(Method::POST, &delivery.url, headers, body.into()).await
    }

    /// One JSON request outside the delivery pipeline (integrations)
    pub async fn send_json(
        &self,
        method: Method,
        url: &str,
        body: &Value,
        headers: &HashMap<String, String>,
        secret: Option<&str>,
    ) -> AttemptOutcome {
        let body = match serde_json::to_vec(body) {
            Ok(body) => body,
            Err(e) => {
                return AttemptOutcome::failed(format!("Failed to serialize payload: {}", e), 0)
            }
        };

        let mut map = self.default_headers();
        apply_custom_headers(&mut map, headers);
        if let Some(secret) = secret.filter(|s| !s.is_empty()) {
            insert_header(&mut map, HEADER_SIGNATURE, &signer::sign(&body, secret));
        }
        self.execute(method, url, map, body.into()).await
    }

    fn default_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        insert_header(&mut headers, USER_AGENT.as_str(), &self.user_agent);
        headers
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> AttemptOutcome {
        let request = OutboundRequest {
            method,
            url: url.to_string(),
            headers,
            body,
            timeout: self.timeout,
            // Room to finish a UTF-8 sequence cut at the limit
            max_response_bytes: Some(self.body_limit.saturating_add(3)),
        };

        let started = Instant::now();
        let result = self.transport.send(request).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(response) => self.outcome_from_response(response, duration_ms),
            Err(e) => {
                tracing::debug!(url, error = %e, "Webhook request failed");
                AttemptOutcome::failed(e.to_string(), duration_ms)
            }
        }
    }

    fn outcome_from_response(
        &self,
        response: TransportResponse,
        duration_ms: u64,
    ) -> AttemptOutcome {
        let success = response.is_success();
        let body = truncate_body(&response.body, self.body_limit);
        let error = (!success).then(|| status_error(response.status));

        AttemptOutcome {
            success,
            status_code: Some(response.status),
            response_body: Some(body),
            error,
            duration_ms,
        }
    }
}

fn user_agent_for(product: &str) -> String {
    format!("{}-Webhook/1.0", product)
}

/// `HTTP 503: Service Unavailable`
pub fn status_error(status: u16) -> String {
    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown Status");
    format!("HTTP {}: {}", status, reason)
}

/// Lossy UTF-8 decode, cut to at most `limit` bytes on a char boundary
pub fn truncate_body(body: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= limit {
        return text.into_owned();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => tracing::warn!(header = name, "Skipping header with invalid name or value"),
    }
}

/// Custom headers override `Content-Type` and `User-Agent`
fn apply_custom_headers(headers: &mut HeaderMap, custom: &HashMap<String, String>) {
    for (name, value) in custom {
        insert_header(headers, name, value);
    }
}
