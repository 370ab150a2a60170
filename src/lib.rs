//! # a3s-webhook
//!
//! Event-triggered webhook delivery, retry scheduling, and integrations for
//! the A3S ecosystem.
//!
//! ## Overview
//!
//! Producers trigger domain events; the engine matches them against
//! registered subscriptions (event type, wildcard, and field filters),
//! POSTs a signed JSON payload to each endpoint, and retries failures with
//! exponential backoff. Every attempt is recorded as a `Delivery` that can
//! be queried, retried, or deleted. Integrations are stored actions
//! (webhook, api, email, slack, discord, teams) executed on demand.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_webhook::{EngineConfig, Event, NewSubscription, WebhookEngine};
//!
//! # async fn example() -> a3s_webhook::Result<()> {
//! let engine = WebhookEngine::new(EngineConfig::default())?;
//! engine.start();
//!
//! engine
//!     .create_subscription(
//!         NewSubscription::new("https://example.com/hooks", vec!["document.processed".into()])
//!             .with_secret("s3cret"),
//!     )
//!     .await?;
//!
//! engine
//!     .trigger(Event::new("document.processed", serde_json::json!({"documentId": "d-1"})))
//!     .await?;
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **WebhookEngine**: wires everything from an `EngineConfig`
//! - **EventDispatcher**: bounded queue, fan-out, attempts, retries
//! - **SubscriptionRegistry** / **DeliveryStore**: records behind a `StateStore`
//! - **DeliveryExecutor**: one signed HTTP attempt over an `HttpTransport`
//! - **Scheduler**: injectable timers (`TokioScheduler`, `ManualScheduler`)
//! - **IntegrationExecutor**: one `IntegrationHandler` per integration type
//! - **RetentionSweeper**: purges deliveries past the retention window

pub mod config;
pub mod delivery_store;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod filter;
pub mod integration;
pub mod queue;
pub mod registry;
pub mod retention;
pub mod retry;
pub mod scheduler;
pub mod signer;
pub mod state;
pub mod transport;
pub mod types;

// Re-export core types
pub use config::EngineConfig;
pub use delivery_store::{DeliveryStats, DeliveryStore};
pub use dispatcher::{DispatcherOptions, EventDispatcher};
pub use engine::{EngineBuilder, EngineStats, WebhookEngine};
pub use error::{Result, WebhookError};
pub use executor::{AttemptOutcome, DeliveryExecutor, WebhookPayload};
pub use integration::{
    ChatMessage, ChatSender, EmailMessage, EmailSender, ExecutionResult, IntegrationExecutor,
    IntegrationHandler, IntegrationTemplate,
};
pub use queue::OverflowPolicy;
pub use registry::SubscriptionRegistry;
pub use retention::RetentionSweeper;
pub use scheduler::{CancelToken, ManualScheduler, Scheduler, TokioScheduler};
pub use state::{FileStateStore, MemoryStateStore, StateStore};
pub use transport::{
    HttpTransport, OutboundRequest, ReqwestTransport, TransportError, TransportResponse,
};
pub use types::{
    Delivery, DeliveryQuery, DeliveryStatus, Event, FilterCondition, FilterLogic, FilterOperator,
    FilterSpec, Integration, IntegrationType, IntegrationUpdate, NewIntegration, NewSubscription,
    Page, RetryPolicy, Subscription, SubscriptionUpdate,
};
