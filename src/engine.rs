//! High-level webhook engine
//!
//! `WebhookEngine` wires the registry, delivery store, dispatcher,
//! integration executor, and retention sweeper together from an
//! `EngineConfig` and exposes the full public API in one place.

use crate::config::EngineConfig;
use crate::delivery_store::{DeliveryStats, DeliveryStore};
use crate::dispatcher::EventDispatcher;
use crate::error::Result;
use crate::executor::DeliveryExecutor;
use crate::integration::{
    ChatHandler, ChatSender, EmailSender, ExecutionResult, IntegrationExecutor, IntegrationTemplate,
};
use crate::registry::SubscriptionRegistry;
use crate::retention::RetentionSweeper;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::state::{FileStateStore, MemoryStateStore, StateStore};
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::types::{
    Delivery, DeliveryQuery, Event, Integration, IntegrationType, IntegrationUpdate,
    NewIntegration, NewSubscription, Page, Subscription, SubscriptionUpdate,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Engine-wide counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    #[serde(flatten)]
    pub deliveries: DeliveryStats,

    pub subscriptions: usize,

    pub active_subscriptions: usize,

    pub integrations: usize,

    /// Retry timers currently waiting
    pub pending_retries: usize,

    /// Events accepted but not yet taken by the worker
    pub queued_events: usize,
}

/// Builder for `WebhookEngine`; unset collaborators get production defaults
pub struct EngineBuilder {
    config: EngineConfig,
    state: Option<Arc<dyn StateStore>>,
    transport: Option<Arc<dyn HttpTransport>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    email: Option<Arc<dyn EmailSender>>,
    chat: Option<Arc<dyn ChatSender>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: None,
            transport: None,
            scheduler: None,
            email: None,
            chat: None,
        }
    }

    /// Override snapshot storage (default: `stateDir` files, else memory)
    pub fn state_store(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    /// Override outbound HTTP (default: reqwest)
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Override timers (default: tokio)
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Enable `email` integrations
    pub fn email_sender(mut self, sender: Arc<dyn EmailSender>) -> Self {
        self.email = Some(sender);
        self
    }

    /// Replace the HTTP chat sender used by slack/discord/teams integrations
    pub fn chat_sender(mut self, sender: Arc<dyn ChatSender>) -> Self {
        self.chat = Some(sender);
        self
    }

    pub fn build(self) -> Result<WebhookEngine> {
        let config = self.config;
        config.validate()?;

        let state: Arc<dyn StateStore> = match (self.state, &config.state_dir) {
            (Some(state), _) => state,
            (None, Some(dir)) => Arc::new(FileStateStore::new(dir)),
            (None, None) => Arc::new(MemoryStateStore::new()),
        };
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(TokioScheduler::new()));

        let registry = Arc::new(SubscriptionRegistry::new(state.clone())?);
        let deliveries = Arc::new(DeliveryStore::new(state)?);
        let executor = Arc::new(
            DeliveryExecutor::new(transport)
                .with_timeout(config.request_timeout())
                .with_user_agent_product(&config.user_agent_product)
                .with_body_limit(config.response_body_limit),
        );

        let dispatcher = Arc::new(EventDispatcher::new(
            registry.clone(),
            deliveries.clone(),
            executor.clone(),
            scheduler,
            config.dispatcher_options(),
        ));

        let mut integrations =
            IntegrationExecutor::with_default_handlers(registry.clone(), executor, self.email);
        if let Some(chat) = self.chat {
            for platform in IntegrationType::ALL {
                if let Some(handler) = ChatHandler::new(platform, chat.clone()) {
                    integrations.register(Arc::new(handler));
                }
            }
        }

        let hook_dispatcher = dispatcher.clone();
        let sweeper = Arc::new(
            RetentionSweeper::new(deliveries.clone())
                .with_retention_days(config.retention_days)
                .with_interval(config.sweep_interval())
                .with_purge_hook(Arc::new(move |ids: &[String]| {
                    hook_dispatcher.release_deliveries(ids)
                })),
        );

        tracing::debug!(
            queue_capacity = config.queue_capacity,
            overflow_policy = ?config.overflow_policy,
            persistent = config.state_dir.is_some(),
            "Webhook engine built"
        );

        Ok(WebhookEngine {
            config,
            registry,
            deliveries,
            dispatcher,
            integrations,
            sweeper,
        })
    }
}

/// Event-triggered webhook delivery with retries, plus on-demand integrations
pub struct WebhookEngine {
    config: EngineConfig,
    registry: Arc<SubscriptionRegistry>,
    deliveries: Arc<DeliveryStore>,
    dispatcher: Arc<EventDispatcher>,
    integrations: IntegrationExecutor,
    sweeper: Arc<RetentionSweeper>,
}

impl WebhookEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Engine with default collaborators
    pub fn new(config: EngineConfig) -> Result<Self> {
        EngineBuilder::new(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Start the dispatch worker and the retention sweeper
    ///
    /// Pending and retrying deliveries loaded from state are re-armed here.
    pub fn start(&self) {
        self.dispatcher.start();
        self.sweeper.start();
        tracing::info!("Webhook engine started");
    }

    /// Stop sweeping, drain queued events, and cancel waiting retries
    ///
    /// Retrying deliveries stay `retrying` in state for the next engine.
    pub async fn shutdown(&self) {
        self.sweeper.stop();
        self.dispatcher.shutdown().await;
    }

    // ─── Subscriptions ───────────────────────────────────────────

    pub async fn create_subscription(&self, new: NewSubscription) -> Result<Subscription> {
        self.registry.create(new).await
    }

    pub async fn update_subscription(
        &self,
        id: &str,
        update: SubscriptionUpdate,
    ) -> Result<Subscription> {
        self.registry.update(id, update).await
    }

    pub async fn delete_subscription(&self, id: &str) -> Result<Subscription> {
        self.dispatcher.delete_subscription(id).await
    }

    pub async fn get_subscription(&self, id: &str) -> Option<Subscription> {
        self.registry.get(id).await
    }

    pub async fn list_subscriptions(&self, active: Option<bool>) -> Vec<Subscription> {
        self.registry.list(active).await
    }

    pub async fn test_subscription(&self, id: &str) -> Result<Delivery> {
        self.dispatcher.test_subscription(id).await
    }

    // ─── Events & deliveries ─────────────────────────────────────

    /// Queue an event for delivery; never fails because of delivery outcomes
    pub async fn trigger(&self, event: Event) -> Result<Event> {
        self.dispatcher.trigger(event).await
    }

    /// Convenience for `trigger(Event::new(event_type, data))`
    pub async fn emit(&self, event_type: &str, data: Value) -> Result<Event> {
        self.trigger(Event::new(event_type, data)).await
    }

    /// Dispatch synchronously, bypassing the queue
    pub async fn dispatch(&self, event: Event) -> Vec<Delivery> {
        self.dispatcher.dispatch(event).await
    }

    /// Wait until every triggered event has been processed
    pub async fn flush(&self) {
        self.dispatcher.flush().await
    }

    pub async fn get_delivery(&self, id: &str) -> Option<Delivery> {
        self.dispatcher.get_delivery(id).await
    }

    pub async fn list_deliveries(&self, query: &DeliveryQuery) -> Page<Delivery> {
        self.dispatcher.list_deliveries(query).await
    }

    pub async fn retry_delivery(&self, id: &str) -> Result<Delivery> {
        self.dispatcher.retry_delivery(id).await
    }

    pub async fn delete_delivery(&self, id: &str) -> Result<Delivery> {
        self.dispatcher.delete_delivery(id).await
    }

    pub fn verify_signature(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        self.dispatcher.verify_signature(payload, signature, secret)
    }

    /// Run one retention sweep now
    pub async fn sweep_now(&self) -> Result<usize> {
        self.sweeper.sweep_once(Utc::now()).await
    }

    // ─── Integrations ────────────────────────────────────────────

    pub fn integration_templates(&self) -> &'static [IntegrationTemplate] {
        self.integrations.templates()
    }

    pub async fn create_integration(&self, new: NewIntegration) -> Result<Integration> {
        self.registry.create_integration(new).await
    }

    pub async fn update_integration(
        &self,
        id: &str,
        update: IntegrationUpdate,
    ) -> Result<Integration> {
        self.registry.update_integration(id, update).await
    }

    pub async fn delete_integration(&self, id: &str) -> Result<Integration> {
        self.registry.delete_integration(id).await
    }

    pub async fn get_integration(&self, id: &str) -> Option<Integration> {
        self.registry.get_integration(id).await
    }

    pub async fn list_integrations(&self) -> Vec<Integration> {
        self.registry.list_integrations().await
    }

    pub async fn execute_integration(&self, id: &str, data: Value) -> Result<ExecutionResult> {
        self.integrations.execute(id, data).await
    }

    // ─── Stats ───────────────────────────────────────────────────

    pub async fn stats(&self) -> EngineStats {
        let (subscriptions, active_subscriptions) = self.registry.counts().await;
        EngineStats {
            deliveries: self.deliveries.stats().await,
            subscriptions,
            active_subscriptions,
            integrations: self.registry.integration_count().await,
            pending_retries: self.dispatcher.pending_retries(),
            queued_events: self.dispatcher.queue_len().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use crate::transport::testing::RecordingTransport;
    use crate::types::DeliveryStatus;
    use serde_json::json;
    use std::time::Duration;

    fn engine(status: u16, state: Arc<dyn StateStore>) -> (WebhookEngine, Arc<ManualScheduler>) {
        let clock = Arc::new(ManualScheduler::new());
        let engine = WebhookEngine::builder(EngineConfig::default())
            .transport(Arc::new(RecordingTransport::always(status)))
            .scheduler(clock.clone())
            .state_store(state)
            .build()
            .unwrap();
        (engine, clock)
    }

    #[tokio::test]
    async fn test_stats_cover_every_store() {
        let (engine, _clock) = engine(500, Arc::new(MemoryStateStore::new()));
        engine
            .create_subscription(NewSubscription::new("https://ex.com/a", vec!["*".to_string()]))
            .await
            .unwrap();
        engine
            .create_integration(NewIntegration::new(
                "Hook",
                IntegrationType::Webhook,
                json!({"url": "https://ex.com/b"}),
            ))
            .await
            .unwrap();

        engine.dispatch(Event::new("x", json!({}))).await;

        let stats = engine.stats().await;
        assert_eq!(stats.subscriptions, 1);
        assert_eq!(stats.active_subscriptions, 1);
        assert_eq!(stats.integrations, 1);
        assert_eq!(stats.pending_retries, 1);
        assert_eq!(stats.deliveries.retrying, 1);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["retrying"], 1);
        assert_eq!(json["pendingRetries"], 1);
    }

    #[tokio::test]
    async fn test_state_survives_rebuild() {
        let state: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let delivery_id = {
            let (engine, _clock) = engine(200, state.clone());
            engine
                .create_subscription(NewSubscription::new(
                    "https://ex.com/a",
                    vec!["*".to_string()],
                ))
                .await
                .unwrap();
            engine.dispatch(Event::new("x", json!({}))).await.remove(0).id
        };

        let (engine, _clock) = engine(200, state);
        assert_eq!(engine.list_subscriptions(None).await.len(), 1);
        let d = engine.get_delivery(&delivery_id).await.unwrap();
        assert_eq!(d.status, DeliveryStatus::Success);
    }

    #[tokio::test]
    async fn test_rebuilt_engine_resumes_retry() {
        let state: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let delivery_id = {
            let (engine, clock) = engine(500, state.clone());
            engine.start();
            engine
                .create_subscription(NewSubscription::new(
                    "https://ex.com/a",
                    vec!["*".to_string()],
                ))
                .await
                .unwrap();
            let id = engine.dispatch(Event::new("x", json!({}))).await.remove(0).id;
            engine.shutdown().await;
            assert_eq!(clock.pending(), 0);
            id
        };

        let (engine, clock) = engine(200, state);
        assert_eq!(engine.stats().await.pending_retries, 0);
        engine.start();
        assert_eq!(engine.stats().await.pending_retries, 1);

        clock.advance(Duration::from_secs(1)).await;
        let d = engine.get_delivery(&delivery_id).await.unwrap();
        assert_eq!((d.status, d.attempts), (DeliveryStatus::Success, 2));
        assert!(d.next_retry_at.is_none());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_config_applied_to_executor() {
        let clock = Arc::new(ManualScheduler::new());
        let transport = Arc::new(RecordingTransport::always(500));
        let config = EngineConfig {
            request_timeout_secs: 5,
            user_agent_product: "Acme".to_string(),
            max_retry_delay_ms: Some(1500),
            ..EngineConfig::default()
        };
        let engine = WebhookEngine::builder(config)
            .transport(transport.clone())
            .scheduler(clock.clone())
            .build()
            .unwrap();

        engine
            .create_subscription(NewSubscription::new("https://ex.com/a", vec!["*".to_string()]))
            .await
            .unwrap();
        engine.dispatch(Event::new("x", json!({}))).await;
        clock.advance(Duration::from_secs(10)).await;

        let req = &transport.requests()[0];
        assert_eq!(req.timeout, Duration::from_secs(5));
        assert_eq!(req.header("user-agent"), Some("Acme-Webhook/1.0"));
        // 1000, then 2000 and 4000 capped at 1500
        assert_eq!(
            clock.delays(),
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(1500),
                Duration::from_millis(1500)
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_config_fails_build() {
        let config = EngineConfig {
            queue_capacity: 0,
            ..EngineConfig::default()
        };
        assert!(WebhookEngine::builder(config)
            .transport(Arc::new(RecordingTransport::always(200)))
            .build()
            .is_err());
    }
}
