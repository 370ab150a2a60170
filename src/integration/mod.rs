//! Manually-invoked integrations
//!
//! An integration is a stored, typed action (POST to a webhook, call an
//! API, send an email, post to a chat channel) executed on demand with a
//! JSON `data` argument. `IntegrationExecutor` looks up the record,
//! dispatches to the `IntegrationHandler` registered for its type, and
//! bumps the usage counters whatever the outcome.

use crate::error::{Result, WebhookError};
use crate::executor::DeliveryExecutor;
use crate::registry::SubscriptionRegistry;
use crate::types::{Integration, IntegrationType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub mod chat;
pub mod email;
pub mod templates;
pub mod webhook;

pub use chat::{ChatHandler, ChatMessage, ChatSender, HttpChatSender};
pub use email::{EmailHandler, EmailMessage, EmailSender};
pub use templates::{IntegrationTemplate, TemplateCategory};
pub use webhook::HttpHandler;

/// One integration type's execution logic
#[async_trait]
pub trait IntegrationHandler: Send + Sync {
    /// Type this handler serves
    fn integration_type(&self) -> IntegrationType;

    /// Run the integration, returning handler-specific output
    async fn execute(&self, integration: &Integration, data: &Value) -> Result<Value>;
}

/// Outcome of a successful execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub integration_id: String,
    pub success: bool,
    pub output: Value,
    pub duration_ms: u64,
}

/// Executes integrations through a handler registry keyed by type
pub struct IntegrationExecutor {
    registry: Arc<SubscriptionRegistry>,
    handlers: HashMap<IntegrationType, Arc<dyn IntegrationHandler>>,
}

impl IntegrationExecutor {
    /// Executor with no handlers registered
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            registry,
            handlers: HashMap::new(),
        }
    }

    /// Executor with HTTP and chat handlers over `executor`, plus email when a sender is given
    pub fn with_default_handlers(
        registry: Arc<SubscriptionRegistry>,
        executor: Arc<DeliveryExecutor>,
        email: Option<Arc<dyn EmailSender>>,
    ) -> Self {
        let mut this = Self::new(registry);
        this.register(Arc::new(HttpHandler::webhook(executor.clone())));
        this.register(Arc::new(HttpHandler::api(executor.clone())));

        let chat: Arc<dyn ChatSender> = Arc::new(HttpChatSender::new(executor));
        for platform in [IntegrationType::Slack, IntegrationType::Discord, IntegrationType::Teams] {
            if let Some(handler) = ChatHandler::new(platform, chat.clone()) {
                this.register(Arc::new(handler));
            }
        }

        if let Some(sender) = email {
            this.register(Arc::new(EmailHandler::new(sender)));
        }
        this
    }

    /// Register (or replace) the handler for its type
    pub fn register(&mut self, handler: Arc<dyn IntegrationHandler>) {
        self.handlers.insert(handler.integration_type(), handler);
    }

    pub fn supports(&self, integration_type: IntegrationType) -> bool {
        self.handlers.contains_key(&integration_type)
    }

    /// Static template catalog
    pub fn templates(&self) -> &'static [IntegrationTemplate] {
        templates::catalog()
    }

    /// Execute an integration once
    ///
    /// Missing, inactive, or unhandled integrations are rejected before any
    /// bookkeeping. Otherwise counters are updated and persisted, then the
    /// handler's error (if any) is returned.
    pub async fn execute(&self, integration_id: &str, data: Value) -> Result<ExecutionResult> {
        let integration = self
            .registry
            .get_integration(integration_id)
            .await
            .ok_or_else(|| WebhookError::not_found("Integration", integration_id))?;

        if !integration.active {
            return Err(WebhookError::InvalidState(format!(
                "Integration {} is inactive",
                integration_id
            )));
        }

        let handler = self.handlers.get(&integration.integration_type).ok_or_else(|| {
            WebhookError::Config(format!(
                "No handler registered for integration type '{}'",
                integration.integration_type
            ))
        })?;

        let started = Instant::now();
        let result = handler.execute(&integration, &data).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        self.registry
            .record_integration_usage(integration_id, result.is_ok())
            .await?;

        match result {
            Ok(output) => {
                tracing::info!(
                    integration_id,
                    integration_type = %integration.integration_type,
                    duration_ms,
                    "Integration executed"
                );
                Ok(ExecutionResult {
                    integration_id: integration_id.to_string(),
                    success: true,
                    output,
                    duration_ms,
                })
            }
            Err(e) => {
                tracing::warn!(
                    integration_id,
                    integration_type = %integration.integration_type,
                    error = %e,
                    "Integration execution failed"
                );
                Err(e)
            }
        }
    }
}

// ─── Config helpers ──────────────────────────────────────────────

pub(crate) fn config_str<'a>(config: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub(crate) fn required_str<'a>(integration: &'a Integration, key: &str) -> Result<&'a str> {
    config_str(&integration.config, key).ok_or_else(|| {
        WebhookError::Config(format!(
            "Integration {} is missing config.{}",
            integration.id, key
        ))
    })
}

/// `config.headers` as a string map; non-string values are skipped
pub(crate) fn config_headers(config: &Map<String, Value>) -> HashMap<String, String> {
    config
        .get("headers")
        .and_then(Value::as_object)
        .map(|headers| {
            headers
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Render `config.<key>` (or `fallback`) against the data
///
/// Empty output falls back to the data's JSON.
pub(crate) fn render_text(
    config: &Map<String, Value>,
    key: &str,
    fallback: &str,
    data: &Value,
) -> String {
    let template = config_str(config, key).unwrap_or(fallback);
    let rendered = templates::render(template, data);
    if rendered.trim().is_empty() {
        serde_json::to_string_pretty(data).unwrap_or_default()
    } else {
        rendered
    }
}
