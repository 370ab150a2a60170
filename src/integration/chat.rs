//! Chat-platform integrations: Slack, Discord, Microsoft Teams
//!
//! Each platform gets its own message shape; posting goes through a
//! `ChatSender`, by default `HttpChatSender` over the delivery executor.

use super::{config_str, render_text, required_str, IntegrationHandler};
use super::webhook::outcome_to_output;
use crate::error::Result;
use crate::executor::DeliveryExecutor;
use crate::types::{Integration, IntegrationType};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A platform-shaped message bound for an incoming-webhook URL
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub platform: IntegrationType,
    pub webhook_url: String,
    pub payload: Value,
}

/// Posts chat messages
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn post(&self, message: ChatMessage) -> Result<Value>;
}

/// Posts the payload as JSON to the platform webhook URL
pub struct HttpChatSender {
    executor: Arc<DeliveryExecutor>,
}

impl HttpChatSender {
    pub fn new(executor: Arc<DeliveryExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl ChatSender for HttpChatSender {
    async fn post(&self, message: ChatMessage) -> Result<Value> {
        let outcome = self
            .executor
            .send_json(Method::POST, &message.webhook_url, &message.payload, &HashMap::new(), None)
            .await;
        outcome_to_output(outcome)
    }
}

/// Handler for one chat platform
pub struct ChatHandler {
    platform: IntegrationType,
    sender: Arc<dyn ChatSender>,
}

impl ChatHandler {
    /// `None` for non-chat integration types
    pub fn new(platform: IntegrationType, sender: Arc<dyn ChatSender>) -> Option<Self> {
        platform.is_chat().then_some(Self { platform, sender })
    }
}

#[async_trait]
impl IntegrationHandler for ChatHandler {
    fn integration_type(&self) -> IntegrationType {
        self.platform
    }

    async fn execute(&self, integration: &Integration, data: &Value) -> Result<Value> {
        let webhook_url = required_str(integration, "webhookUrl")?.to_string();
        let text = render_text(&integration.config, "template", "{{message}}", data);
        let payload = platform_payload(self.platform, &integration.config, &text, data);

        self.sender
            .post(ChatMessage {
                platform: self.platform,
                webhook_url,
                payload,
            })
            .await
    }
}

/// Build the JSON body each platform's incoming webhook expects
pub fn platform_payload(
    platform: IntegrationType,
    config: &Map<String, Value>,
    text: &str,
    data: &Value,
) -> Value {
    match platform {
        IntegrationType::Discord => {
            let mut payload = json!({ "content": text });
            if let Some(username) = config_str(config, "username") {
                payload["username"] = json!(username);
            }
            payload
        }
        IntegrationType::Teams => {
            let title = config_str(config, "title")
                .map(|t| super::templates::render(t, data))
                .or_else(|| data.get("title").and_then(Value::as_str).map(String::from))
                .unwrap_or_else(|| "Notification".to_string());
            json!({
                "@type": "MessageCard",
                "@context": "https://schema.org/extensions",
                "summary": title,
                "title": title,
                "text": text,
            })
        }
        // Slack shape is also the fallback for any other type
        _ => {
            let mut payload = json!({ "text": text });
            if let Some(channel) = config_str(config, "channel") {
                payload["channel"] = json!(channel);
            }
            if let Some(username) = config_str(config, "username") {
                payload["username"] = json!(username);
            }
            payload
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use chrono::Utc;

    fn integration(platform: IntegrationType, config: Value) -> Integration {
        let now = Utc::now();
        Integration {
            id: "int-chat".to_string(),
            name: "Chat".to_string(),
            integration_type: platform,
            config: config.as_object().cloned().unwrap(),
            active: true,
            usage_count: 0,
            success_count: 0,
            error_count: 0,
            last_used: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_slack_payload() {
        let payload = platform_payload(
            IntegrationType::Slack,
            &config(json!({"channel": "#ops", "username": "bot"})),
            "hello",
            &json!({}),
        );
        assert_eq!(payload, json!({"text": "hello", "channel": "#ops", "username": "bot"}));
    }

    #[test]
    fn test_discord_payload() {
        let payload =
            platform_payload(IntegrationType::Discord, &config(json!({})), "hello", &json!({}));
        assert_eq!(payload, json!({"content": "hello"}));
    }

    #[test]
    fn test_teams_payload() {
        let payload = platform_payload(
            IntegrationType::Teams,
            &config(json!({"title": "Alert: {{level}}"})),
            "disk full",
            &json!({"level": "high"}),
        );
        assert_eq!(payload["@type"], "MessageCard");
        assert_eq!(payload["title"], "Alert: high");
        assert_eq!(payload["summary"], "Alert: high");
        assert_eq!(payload["text"], "disk full");

        let untitled =
            platform_payload(IntegrationType::Teams, &config(json!({})), "x", &json!({}));
        assert_eq!(untitled["title"], "Notification");
    }

    #[test]
    fn test_handler_only_for_chat_types() {
        let transport = Arc::new(RecordingTransport::always(200));
        let sender: Arc<dyn ChatSender> =
            Arc::new(HttpChatSender::new(Arc::new(DeliveryExecutor::new(transport))));
        assert!(ChatHandler::new(IntegrationType::Slack, sender.clone()).is_some());
        assert!(ChatHandler::new(IntegrationType::Email, sender).is_none());
    }

    #[tokio::test]
    async fn test_slack_posts_rendered_message() {
        let transport = Arc::new(RecordingTransport::always(200));
        let executor = Arc::new(DeliveryExecutor::new(transport.clone()));
        let sender = Arc::new(HttpChatSender::new(executor));
        let handler = ChatHandler::new(IntegrationType::Slack, sender).unwrap();

        handler
            .execute(
                &integration(
                    IntegrationType::Slack,
                    json!({
                        "webhookUrl": "https://hooks.slack.com/services/T/B/X",
                        "template": "Doc {{id}} done"
                    }),
                ),
                &json!({"id": "d-9"}),
            )
            .await
            .unwrap();

        let req = &transport.requests()[0];
        assert_eq!(req.url, "https://hooks.slack.com/services/T/B/X");
        let body: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body["text"], "Doc d-9 done");
    }

    #[tokio::test]
    async fn test_chat_failure_propagates() {
        let transport = Arc::new(RecordingTransport::always(500));
        let sender = Arc::new(HttpChatSender::new(Arc::new(DeliveryExecutor::new(transport))));
        let handler = ChatHandler::new(IntegrationType::Discord, sender).unwrap();
        let result = handler
            .execute(
                &integration(
                    IntegrationType::Discord,
                    json!({"webhookUrl": "https://discord.com/api/webhooks/1/x"}),
                ),
                &json!({"message": "hi"}),
            )
            .await;
        assert!(result.is_err());
    }
}
