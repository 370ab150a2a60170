//! Email integrations through an injected sender

use super::{config_str, render_text, templates, IntegrationHandler};
use crate::error::{Result, WebhookError};
use crate::types::{Integration, IntegrationType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

const DEFAULT_SUBJECT: &str = "Notification";

/// A rendered email ready for delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Mail transport supplied by the embedding application
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<()>;
}

/// Renders `config.subject`/`config.template` and hands the message to the sender
pub struct EmailHandler {
    sender: Arc<dyn EmailSender>,
}

impl EmailHandler {
    pub fn new(sender: Arc<dyn EmailSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl IntegrationHandler for EmailHandler {
    fn integration_type(&self) -> IntegrationType {
        IntegrationType::Email
    }

    async fn execute(&self, integration: &Integration, data: &Value) -> Result<Value> {
        let to = recipients(integration.config.get("to"));
        if to.is_empty() {
            return Err(WebhookError::Config(format!(
                "Integration {} has no email recipients",
                integration.id
            )));
        }

        let subject_template = config_str(&integration.config, "subject").unwrap_or("{{title}}");
        let subject = match templates::render(subject_template, data).trim() {
            "" => DEFAULT_SUBJECT.to_string(),
            s => s.to_string(),
        };
        let body = render_text(&integration.config, "template", "{{message}}", data);

        let message = EmailMessage { to, subject, body };
        let recipients = message.to.len();
        self.sender.send(message).await?;

        Ok(json!({ "recipients": recipients }))
    }
}

/// `to` may be a single address, a comma-separated list, or an array
fn recipients(value: Option<&Value>) -> Vec<String> {
    let split = |s: &str| -> Vec<String> {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    };
    match value {
        Some(Value::String(s)) => split(s),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .flat_map(|s| split(s))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<EmailMessage>>,
    }

    #[async_trait]
    impl EmailSender for Outbox {
        async fn send(&self, message: EmailMessage) -> Result<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn integration(config: Value) -> Integration {
        let now = Utc::now();
        Integration {
            id: "int-mail".to_string(),
            name: "Mail".to_string(),
            integration_type: IntegrationType::Email,
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

    #[tokio::test]
    async fn test_renders_and_sends() {
        let outbox = Arc::new(Outbox::default());
        let handler = EmailHandler::new(outbox.clone());
        let config = json!({
            "to": ["ops@ex.com", "dev@ex.com, qa@ex.com"],
            "subject": "Document {{doc.name}} ready",
            "template": "{{doc.pages}} pages processed"
        });

        let output = handler
            .execute(&integration(config), &json!({"doc": {"name": "inv.pdf", "pages": 3}}))
            .await
            .unwrap();
        assert_eq!(output["recipients"], 3);

        let sent = outbox.sent.lock().unwrap();
        assert_eq!(sent[0].to, vec!["ops@ex.com", "dev@ex.com", "qa@ex.com"]);
        assert_eq!(sent[0].subject, "Document inv.pdf ready");
        assert_eq!(sent[0].body, "3 pages processed");
    }

    #[tokio::test]
    async fn test_defaults_fall_back() {
        let outbox = Arc::new(Outbox::default());
        let handler = EmailHandler::new(outbox.clone());

        handler
            .execute(
                &integration(json!({"to": "ops@ex.com"})),
                &json!({"title": "Hi", "message": "Body"}),
            )
            .await
            .unwrap();
        handler
            .execute(&integration(json!({"to": "ops@ex.com"})), &json!({"x": 1}))
            .await
            .unwrap();

        let sent = outbox.sent.lock().unwrap();
        assert_eq!((sent[0].subject.as_str(), sent[0].body.as_str()), ("Hi", "Body"));
        assert_eq!(sent[1].subject, DEFAULT_SUBJECT);
        assert!(sent[1].body.contains("\"x\": 1"));
    }

    #[tokio::test]
    async fn test_no_recipients_is_config_error() {
        let handler = EmailHandler::new(Arc::new(Outbox::default()));
        let err = handler
            .execute(&integration(json!({"to": " , "})), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::Config(_)));
    }
}
