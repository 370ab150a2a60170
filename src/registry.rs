//! Subscription and integration registry
//!
//! `SubscriptionRegistry` owns webhook subscriptions and integrations.
//! Every mutation is a read-modify-write under the collection's write lock
//! and is snapshotted through the `StateStore` before it becomes visible;
//! if the snapshot fails the in-memory record is rolled back.

use crate::error::{Result, WebhookError};
use crate::integration::templates;
use crate::state::{load_collection, save_collection, MemoryStateStore, StateStore};
use crate::types::{
    Event, Integration, IntegrationUpdate, NewIntegration, NewSubscription, Subscription,
    SubscriptionUpdate,
};
use chrono::Utc;
use reqwest::header::{HeaderName, HeaderValue};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const SUBSCRIPTIONS: &str = "subscriptions";
const INTEGRATIONS: &str = "integrations";

/// Registry of webhook subscriptions and integrations backed by a `StateStore`
pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<String, Subscription>>,
    integrations: RwLock<HashMap<String, Integration>>,
    state: Arc<dyn StateStore>,
}

impl SubscriptionRegistry {
    /// Create a registry, loading any existing snapshots from the store
    pub fn new(state: Arc<dyn StateStore>) -> Result<Self> {
        let subscriptions: HashMap<String, Subscription> =
            load_collection(state.as_ref(), SUBSCRIPTIONS)?;
        let integrations: HashMap<String, Integration> =
            load_collection(state.as_ref(), INTEGRATIONS)?;

        tracing::debug!(
            subscriptions = subscriptions.len(),
            integrations = integrations.len(),
            "Registry loaded"
        );

        Ok(Self {
            subscriptions: RwLock::new(subscriptions),
            integrations: RwLock::new(integrations),
            state,
        })
    }

    /// Registry with no durable backing, for tests and single-process use
    pub fn in_memory() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            integrations: RwLock::new(HashMap::new()),
            state: Arc::new(MemoryStateStore::new()),
        }
    }

    // ─── Subscriptions ───────────────────────────────────────────

    /// Register a new subscription
    pub async fn create(&self, new: NewSubscription) -> Result<Subscription> {
        let now = Utc::now();
        let subscription = Subscription {
            id: format!("sub-{}", uuid::Uuid::new_v4()),
            url: new.url,
            events: new.events,
            secret: new.secret.filter(|s| !s.is_empty()),
            active: new.active,
            headers: new.headers,
            retry_policy: new.retry_policy,
            filter: new.filter,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };
        validate_subscription(&subscription)?;

        let mut subs = self.subscriptions.write().await;
        subs.insert(subscription.id.clone(), subscription.clone());
        if let Err(e) = save_collection(self.state.as_ref(), SUBSCRIPTIONS, &subs) {
            subs.remove(&subscription.id);
            return Err(e);
        }

        tracing::info!(
            subscription_id = %subscription.id,
            url = %subscription.url,
            events = ?subscription.events,
            "Subscription created"
        );
        Ok(subscription)
    }

    /// Partially update a subscription
    pub async fn update(&self, id: &str, update: SubscriptionUpdate) -> Result<Subscription> {
        let mut subs = self.subscriptions.write().await;
        let previous = subs
            .get(id)
            .cloned()
            .ok_or_else(|| WebhookError::not_found("Subscription", id))?;

        let mut updated = previous.clone();
        update.apply_to(&mut updated);
        validate_subscription(&updated)?;

        subs.insert(id.to_string(), updated.clone());
        if let Err(e) = save_collection(self.state.as_ref(), SUBSCRIPTIONS, &subs) {
            subs.insert(id.to_string(), previous);
            return Err(e);
        }

        tracing::info!(subscription_id = %id, "Subscription updated");
        Ok(updated)
    }

    /// Hard-delete a subscription; its deliveries are kept
    pub async fn delete(&self, id: &str) -> Result<Subscription> {
        let mut subs = self.subscriptions.write().await;
        let removed = subs
            .remove(id)
            .ok_or_else(|| WebhookError::not_found("Subscription", id))?;

        if let Err(e) = save_collection(self.state.as_ref(), SUBSCRIPTIONS, &subs) {
            subs.insert(id.to_string(), removed);
            return Err(e);
        }

        tracing::info!(subscription_id = %id, "Subscription deleted");
        Ok(removed)
    }

    /// Get a specific subscription
    pub async fn get(&self, id: &str) -> Option<Subscription> {
        self.subscriptions.read().await.get(id).cloned()
    }

    /// All subscriptions, newest first, optionally filtered by active flag
    pub async fn list(&self, active: Option<bool>) -> Vec<Subscription> {
        let subs = self.subscriptions.read().await;
        let mut list: Vec<Subscription> = subs
            .values()
            .filter(|s| active.map_or(true, |a| s.active == a))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    /// Active subscriptions whose event list and filter accept the event
    pub async fn matching(&self, event: &Event) -> Vec<Subscription> {
        let subs = self.subscriptions.read().await;
        subs.values()
            .filter(|s| s.matches_event_type(&event.event_type))
            .filter(|s| crate::filter::matches(event, s.filter.as_ref()))
            .cloned()
            .collect()
    }

    /// (total, active) subscription counts
    pub async fn counts(&self) -> (usize, usize) {
        let subs = self.subscriptions.read().await;
        (subs.len(), subs.values().filter(|s| s.active).count())
    }

    // ─── Integrations ────────────────────────────────────────────

    /// Create an integration after validating its config against the catalog
    pub async fn create_integration(&self, new: NewIntegration) -> Result<Integration> {
        if new.name.trim().is_empty() {
            return Err(WebhookError::Config("Integration name is required".to_string()));
        }
        templates::validate_config(new.integration_type, &new.config)?;

        let now = Utc::now();
        let integration = Integration {
            id: format!("int-{}", uuid::Uuid::new_v4()),
            name: new.name,
            integration_type: new.integration_type,
            config: new.config,
            active: new.active,
            usage_count: 0,
            success_count: 0,
            error_count: 0,
            last_used: None,
            created_at: now,
            updated_at: now,
        };

        let mut ints = self.integrations.write().await;
        ints.insert(integration.id.clone(), integration.clone());
        if let Err(e) = save_collection(self.state.as_ref(), INTEGRATIONS, &ints) {
            ints.remove(&integration.id);
            return Err(e);
        }

        tracing::info!(
            integration_id = %integration.id,
            integration_type = %integration.integration_type,
            "Integration created"
        );
        Ok(integration)
    }

    /// Partially update an integration
    pub async fn update_integration(
        &self,
        id: &str,
        update: IntegrationUpdate,
    ) -> Result<Integration> {
        let mut ints = self.integrations.write().await;
        let previous = ints
            .get(id)
            .cloned()
            .ok_or_else(|| WebhookError::not_found("Integration", id))?;

        let mut updated = previous.clone();
        update.apply_to(&mut updated);
        templates::validate_config(updated.integration_type, &updated.config)?;

        ints.insert(id.to_string(), updated.clone());
        if let Err(e) = save_collection(self.state.as_ref(), INTEGRATIONS, &ints) {
            ints.insert(id.to_string(), previous);
            return Err(e);
        }

        tracing::info!(integration_id = %id, "Integration updated");
        Ok(updated)
    }

    pub async fn delete_integration(&self, id: &str) -> Result<Integration> {
        let mut ints = self.integrations.write().await;
        let removed = ints
            .remove(id)
            .ok_or_else(|| WebhookError::not_found("Integration", id))?;

        if let Err(e) = save_collection(self.state.as_ref(), INTEGRATIONS, &ints) {
            ints.insert(id.to_string(), removed);
            return Err(e);
        }

        tracing::info!(integration_id = %id, "Integration deleted");
        Ok(removed)
    }

    pub async fn get_integration(&self, id: &str) -> Option<Integration> {
        self.integrations.read().await.get(id).cloned()
    }

    pub async fn list_integrations(&self) -> Vec<Integration> {
        let ints = self.integrations.read().await;
        let mut list: Vec<Integration> = ints.values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    pub async fn integration_count(&self) -> usize {
        self.integrations.read().await.len()
    }

    /// Atomically bump usage counters after an execution
    pub async fn record_integration_usage(&self, id: &str, success: bool) -> Result<Integration> {
        let mut ints = self.integrations.write().await;
        let previous = ints
            .get(id)
            .cloned()
            .ok_or_else(|| WebhookError::not_found("Integration", id))?;

        let mut updated = previous.clone();
        updated.usage_count += 1;
        if success {
            updated.success_count += 1;
        } else {
            updated.error_count += 1;
        }
        updated.last_used = Some(Utc::now());

        ints.insert(id.to_string(), updated.clone());
        if let Err(e) = save_collection(self.state.as_ref(), INTEGRATIONS, &ints) {
            ints.insert(id.to_string(), previous);
            return Err(e);
        }
        Ok(updated)
    }
}

// ─── Validation ──────────────────────────────────────────────────

/// Accept only absolute http(s) URLs
pub fn validate_http_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| WebhookError::Config(format!("Invalid URL '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        _ => Err(WebhookError::Config(format!(
            "URL must use http or https: {}",
            url
        ))),
    }
}

/// Check subscription invariants before it is stored
pub fn validate_subscription(sub: &Subscription) -> Result<()> {
    validate_http_url(&sub.url)?;

    if sub.events.is_empty() {
        return Err(WebhookError::Config(
            "At least one event type is required".to_string(),
        ));
    }
    if sub.events.iter().any(|e| e.trim().is_empty()) {
        return Err(WebhookError::Config("Event types cannot be empty".to_string()));
    }

    let policy = &sub.retry_policy;
    if policy.base_delay_ms == 0 {
        return Err(WebhookError::Config("baseDelayMs must be greater than 0".to_string()));
    }
    if !policy.backoff_multiplier.is_finite() || policy.backoff_multiplier <= 0.0 {
        return Err(WebhookError::Config(format!(
            "backoffMultiplier must be a positive number, got {}",
            policy.backoff_multiplier
        )));
    }

    for (name, value) in &sub.headers {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| WebhookError::Config(format!("Invalid header name: {}", name)))?;
        HeaderValue::from_str(value)
            .map_err(|_| WebhookError::Config(format!("Invalid value for header {}", name)))?;
    }

    Ok(())
}
