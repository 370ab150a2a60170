//! Core record types for the a3s-webhook engine
//!
//! All types use camelCase JSON serialization for wire and snapshot compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Event type wildcard that subscribes to every event
pub const WILDCARD_EVENT: &str = "*";

/// Default event source tag when the producer supplies none
pub const DEFAULT_SOURCE: &str = "system";

// ─── Events ──────────────────────────────────────────────────────

/// An internally generated fact to be delivered to subscribers
///
/// Event types are dot-namespaced (e.g., `document.processed`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique event identifier (evt-<uuid>)
    pub id: String,

    /// Dot-namespaced event type
    #[serde(rename = "type")]
    pub event_type: String,

    /// Event payload (arbitrary JSON)
    pub data: Value,

    /// When the event was produced
    pub timestamp: DateTime<Utc>,

    /// Producing subsystem
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl Event {
    /// Create a new event with auto-generated id and timestamp
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
            source: DEFAULT_SOURCE.to_string(),
            user_id: None,
            session_id: None,
            metadata: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }
}

// ─── Filters ─────────────────────────────────────────────────────

/// Comparison applied by a single filter condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
}

/// How condition results are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilterLogic {
    #[default]
    And,
    Or,
}

/// One predicate over a dot-path field of the event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCondition {
    /// Dot-path into the event payload (e.g., `data.document.kind`)
    pub field: String,

    pub operator: FilterOperator,

    pub value: String,
}

impl FilterCondition {
    pub fn new(
        field: impl Into<String>,
        operator: FilterOperator,
        value: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }
}

/// Subscriber-defined filter; empty conditions always match
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
    #[serde(default)]
    pub conditions: Vec<FilterCondition>,

    #[serde(default)]
    pub logic: FilterLogic,
}

// ─── Subscriptions ───────────────────────────────────────────────

/// Retry/backoff policy for a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the initial attempt (total attempts = max_retries + 1)
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Growth factor applied per retry
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            backoff_multiplier,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Total attempts allowed, including the initial one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 1000, 2.0)
    }
}

/// A registered webhook endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Unique subscription identifier (sub-<uuid>)
    pub id: String,

    pub url: String,

    /// Subscribed event types (`*` matches everything)
    pub events: Vec<String>,

    /// Shared HMAC secret; enables the `X-Signature` header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    pub active: bool,

    /// Extra request headers sent with every delivery
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterSpec>,

    #[serde(default)]
    pub metadata: Map<String, Value>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Check if this subscription should receive a given event type
    pub fn matches_event_type(&self, event_type: &str) -> bool {
        self.active
            && self
                .events
                .iter()
                .any(|e| e == WILDCARD_EVENT || e == event_type)
    }
}

/// Registration request for a new subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubscription {
    pub url: String,

    pub events: Vec<String>,

    #[serde(default)]
    pub secret: Option<String>,

    #[serde(default = "default_true")]
    pub active: bool,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    #[serde(default)]
    pub filter: Option<FilterSpec>,

    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NewSubscription {
    pub fn new(url: impl Into<String>, events: Vec<String>) -> Self {
        Self {
            url: url.into(),
            events,
            secret: None,
            active: true,
            headers: HashMap::new(),
            retry_policy: RetryPolicy::default(),
            filter: None,
            metadata: Map::new(),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_filter(mut self, filter: FilterSpec) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Partial update for a subscription; `None` fields are left untouched
///
/// An empty `secret` clears the secret; a filter with no conditions
/// matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionUpdate {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub events: Option<Vec<String>>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub filter: Option<FilterSpec>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl SubscriptionUpdate {
    /// Merge this update into an existing subscription
    pub fn apply_to(self, sub: &mut Subscription) {
        if let Some(url) = self.url {
            sub.url = url;
        }
        if let Some(events) = self.events {
            sub.events = events;
        }
        if let Some(secret) = self.secret {
            sub.secret = (!secret.is_empty()).then_some(secret);
        }
        if let Some(active) = self.active {
            sub.active = active;
        }
        if let Some(headers) = self.headers {
            sub.headers = headers;
        }
        if let Some(policy) = self.retry_policy {
            sub.retry_policy = policy;
        }
        if let Some(filter) = self.filter {
            sub.filter = Some(filter);
        }
        if let Some(metadata) = self.metadata {
            sub.metadata = metadata;
        }
        sub.updated_at = Utc::now();
    }
}

fn default_true() -> bool {
    true
}

// ─── Deliveries ──────────────────────────────────────────────────

/// Lifecycle state of a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
    Retrying,
}

impl DeliveryStatus {
    /// `success` and `failed` accept no further scheduled attempts
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical delivery of an event to a subscription, across all its attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    /// Unique delivery identifier (dlv-<uuid>)
    pub id: String,

    pub subscription_id: String,

    pub event_id: String,

    pub event_type: String,

    /// Target URL as it was when the delivery was created
    pub url: String,

    pub status: DeliveryStatus,

    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,

    /// Response body, truncated to the configured limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Duration of the most recent attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    pub created_at: DateTime<Utc>,

    /// Event snapshot re-sent on every attempt
    pub event: Event,
}

impl Delivery {
    /// Create a pending delivery, snapshotting the subscription URL
    pub fn pending(subscription: &Subscription, event: &Event) -> Self {
        Self {
            id: format!("dlv-{}", uuid::Uuid::new_v4()),
            subscription_id: subscription.id.clone(),
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            url: subscription.url.clone(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            next_retry_at: None,
            response_status: None,
            response_body: None,
            error: None,
            duration_ms: None,
            created_at: Utc::now(),
            event: event.clone(),
        }
    }
}

/// Query over delivery records, newest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryQuery {
    #[serde(default)]
    pub subscription_id: Option<String>,

    #[serde(default)]
    pub status: Option<DeliveryStatus>,

    #[serde(default = "default_page_limit")]
    pub limit: usize,

    #[serde(default)]
    pub offset: usize,
}

impl Default for DeliveryQuery {
    fn default() -> Self {
        Self {
            subscription_id: None,
            status: None,
            limit: default_page_limit(),
            offset: 0,
        }
    }
}

impl DeliveryQuery {
    pub fn for_subscription(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: Some(subscription_id.into()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: DeliveryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

fn default_page_limit() -> usize {
    50
}

/// One page of query results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,

    /// Total matches before pagination
    pub total: usize,

    pub limit: usize,

    pub offset: usize,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.offset + self.items.len() < self.total
    }
}

// ─── Integrations ────────────────────────────────────────────────

/// Kind of manually-invoked integration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationType {
    Webhook,
    Api,
    Email,
    Slack,
    Discord,
    Teams,
}

impl IntegrationType {
    pub const ALL: [IntegrationType; 6] = [
        Self::Webhook,
        Self::Api,
        Self::Email,
        Self::Slack,
        Self::Discord,
        Self::Teams,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Api => "api",
            Self::Email => "email",
            Self::Slack => "slack",
            Self::Discord => "discord",
            Self::Teams => "teams",
        }
    }

    pub fn is_chat(self) -> bool {
        matches!(self, Self::Slack | Self::Discord | Self::Teams)
    }
}

impl std::fmt::Display for IntegrationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reusable, manually-invoked action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Integration {
    /// Unique integration identifier (int-<uuid>)
    pub id: String,

    pub name: String,

    #[serde(rename = "type")]
    pub integration_type: IntegrationType,

    /// Type-specific configuration
    #[serde(default)]
    pub config: Map<String, Value>,

    pub active: bool,

    #[serde(default)]
    pub usage_count: u64,

    #[serde(default)]
    pub success_count: u64,

    #[serde(default)]
    pub error_count: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Creation request for an integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewIntegration {
    pub name: String,

    #[serde(rename = "type")]
    pub integration_type: IntegrationType,

    #[serde(default)]
    pub config: Map<String, Value>,

    #[serde(default = "default_true")]
    pub active: bool,
}

impl NewIntegration {
    pub fn new(name: impl Into<String>, integration_type: IntegrationType, config: Value) -> Self {
        let config = match config {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            name: name.into(),
            integration_type,
            config,
            active: true,
        }
    }
}

/// Partial update for an integration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Option<Map<String, Value>>,
    #[serde(default)]
    pub active: Option<bool>,
}

impl IntegrationUpdate {
    pub fn apply_to(self, integration: &mut Integration) {
        if let Some(name) = self.name {
            integration.name = name;
        }
        if let Some(config) = self.config {
            integration.config = config;
        }
        if let Some(active) = self.active {
            integration.active = active;
        }
        integration.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscription(events: &[&str]) -> Subscription {
        Subscription {
            id: "sub-1".to_string(),
            url: "https://ex.com/hook".to_string(),
            events: events.iter().map(|e| e.to_string()).collect(),
            secret: None,
            active: true,
            headers: HashMap::new(),
            retry_policy: RetryPolicy::default(),
            filter: None,
            metadata: Map::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_event_creation() {
        let event = Event::new("document.processed", json!({"pages": 3}))
            .with_source("ocr")
            .with_user_id("u-1")
            .with_metadata("tenant", "acme");

        assert!(event.id.starts_with("evt-"));
        assert_eq!(event.event_type, "document.processed");
        assert_eq!(event.source, "ocr");
        assert_eq!(event.user_id.as_deref(), Some("u-1"));
        assert!(event.session_id.is_none());
        assert_eq!(event.metadata.unwrap()["tenant"], "acme");
    }

    #[test]
    fn test_event_default_source() {
        let event = Event::new("a.b", json!(null));
        assert_eq!(event.source, "system");
    }

    #[test]
    fn test_event_serializes_type_field() {
        let event = Event::new("doc.processed", json!({}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "doc.processed");
        assert!(json.get("userId").is_none());
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn test_matches_event_type() {
        let sub = subscription(&["doc.processed", "doc.failed"]);
        assert!(sub.matches_event_type("doc.processed"));
        assert!(!sub.matches_event_type("doc.created"));

        let wildcard = subscription(&["*"]);
        assert!(wildcard.matches_event_type("anything.at.all"));
    }

    #[test]
    fn test_inactive_subscription_never_matches() {
        let mut sub = subscription(&["*"]);
        sub.active = false;
        assert!(!sub.matches_event_type("doc.processed"));
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay(), Duration::from_millis(1000));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn test_new_subscription_deserialize_defaults() {
        let json = r#"{"url": "https://ex.com/hook", "events": ["*"]}"#;
        let new: NewSubscription = serde_json::from_str(json).unwrap();
        assert!(new.active);
        assert!(new.secret.is_none());
        assert_eq!(new.retry_policy, RetryPolicy::default());
    }

    #[test]
    fn test_filter_spec_wire_format() {
        let json = r#"{
            "conditions": [{"field": "type", "operator": "startsWith", "value": "doc"}],
            "logic": "OR"
        }"#;
        let spec: FilterSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.logic, FilterLogic::Or);
        assert_eq!(spec.conditions[0].operator, FilterOperator::StartsWith);

        let spec: FilterSpec = serde_json::from_str(r#"{"conditions": []}"#).unwrap();
        assert_eq!(spec.logic, FilterLogic::And);
    }

    #[test]
    fn test_subscription_update_merges() {
        let mut sub = subscription(&["a"]);
        sub.secret = Some("old".to_string());

        SubscriptionUpdate {
            url: Some("https://new.example.com".to_string()),
            secret: Some(String::new()),
            ..Default::default()
        }
        .apply_to(&mut sub);

        assert_eq!(sub.url, "https://new.example.com");
        assert!(sub.secret.is_none());
        assert_eq!(sub.events, vec!["a"]);
    }

    #[test]
    fn test_delivery_snapshots_url() {
        let mut sub = subscription(&["*"]);
        let event = Event::new("doc.processed", json!({}));
        let delivery = Delivery::pending(&sub, &event);
        sub.url = "https://moved.example.com".to_string();

        assert!(delivery.id.starts_with("dlv-"));
        assert_eq!(delivery.url, "https://ex.com/hook");
        assert_eq!(delivery.status, DeliveryStatus::Pending);
        assert_eq!(delivery.attempts, 0);
    }

    #[test]
    fn test_delivery_status_serialization() {
        assert_eq!(serde_json::to_string(&DeliveryStatus::Retrying).unwrap(), r#""retrying""#);
        assert!(DeliveryStatus::Success.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(!DeliveryStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_page_has_more() {
        let page = Page { items: vec![1, 2], total: 5, limit: 2, offset: 0 };
        assert!(page.has_more());
        let page = Page { items: vec![5], total: 5, limit: 2, offset: 4 };
        assert!(!page.has_more());
    }

    #[test]
    fn test_integration_type_wire_names() {
        let t: IntegrationType = serde_json::from_str(r#""slack""#).unwrap();
        assert_eq!(t, IntegrationType::Slack);
        assert!(t.is_chat());
        assert!(!IntegrationType::Email.is_chat());
        assert_eq!(IntegrationType::ALL.len(), 6);
    }
}
