//! HTTP integrations: `webhook` and `api`

use super::{config_headers, config_str, required_str, IntegrationHandler};
use crate::error::{Result, WebhookError};
use crate::executor::{AttemptOutcome, DeliveryExecutor, HEADER_EVENT_TYPE};
use crate::types::{Integration, IntegrationType};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;

/// Event type carried by `webhook` integration envelopes
pub const INTEGRATION_EVENT_TYPE: &str = "integration.execute";

/// Single-attempt HTTP call, no retry scheduling
///
/// `webhook` POSTs a signed envelope `{id, type, data, timestamp}`;
/// `api` sends `data` as the body using `config.method` (default POST).
pub struct HttpHandler {
    kind: IntegrationType,
    executor: Arc<DeliveryExecutor>,
}

impl HttpHandler {
    pub fn webhook(executor: Arc<DeliveryExecutor>) -> Self {
        Self {
            kind: IntegrationType::Webhook,
            executor,
        }
    }

    pub fn api(executor: Arc<DeliveryExecutor>) -> Self {
        Self {
            kind: IntegrationType::Api,
            executor,
        }
    }
}

#[async_trait]
impl IntegrationHandler for HttpHandler {
    fn integration_type(&self) -> IntegrationType {
        self.kind
    }

    async fn execute(&self, integration: &Integration, data: &Value) -> Result<Value> {
        let url = required_str(integration, "url")?;
        let mut headers = config_headers(&integration.config);
        let secret = config_str(&integration.config, "secret");

        let (method, body) = match self.kind {
            IntegrationType::Api => (api_method(integration)?, data.clone()),
            _ => {
                if !headers.keys().any(|k| k.eq_ignore_ascii_case(HEADER_EVENT_TYPE)) {
                    headers.insert(
                        HEADER_EVENT_TYPE.to_string(),
                        INTEGRATION_EVENT_TYPE.to_string(),
                    );
                }
                let envelope = json!({
                    "id": integration.id,
                    "type": INTEGRATION_EVENT_TYPE,
                    "data": data,
                    "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                });
                (Method::POST, envelope)
            }
        };

        let outcome = self
            .executor
            .send_json(method, url, &body, &headers, secret)
            .await;
        outcome_to_output(outcome)
    }
}

fn api_method(integration: &Integration) -> Result<Method> {
    let method = config_str(&integration.config, "method").unwrap_or("POST");
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| WebhookError::Config(format!("Invalid HTTP method: {}", method)))
}

pub(crate) fn outcome_to_output(outcome: AttemptOutcome) -> Result<Value> {
    if outcome.success {
        Ok(json!({
            "statusCode": outcome.status_code,
            "responseBody": outcome.response_body,
            "durationMs": outcome.duration_ms,
        }))
    } else {
        Err(WebhookError::Delivery(
            outcome.error.unwrap_or_else(|| "Request failed".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer;
    use crate::transport::testing::RecordingTransport;
    use serde_json::Map;

    fn integration(kind: IntegrationType, config: Value) -> Integration {
        let now = Utc::now();
        Integration {
            id: "int-1".to_string(),
            name: "Test".to_string(),
            integration_type: kind,
            config: config.as_object().cloned().unwrap_or_else(Map::new),
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
    async fn test_webhook_posts_signed_envelope() {
        let transport = Arc::new(RecordingTransport::always(200));
        let handler = HttpHandler::webhook(Arc::new(DeliveryExecutor::new(transport.clone())));
        let config = json!({
            "url": "https://ex.com/hook",
            "secret": "s",
            "headers": {"X-Tenant": "acme"}
        });

        let output = handler
            .execute(&integration(IntegrationType::Webhook, config), &json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(output["statusCode"], 200);

        let req = &transport.requests()[0];
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.header("x-tenant"), Some("acme"));
        assert!(signer::verify(&req.body, req.header("x-signature").unwrap(), "s"));

        let body: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body["type"], INTEGRATION_EVENT_TYPE);
        assert_eq!(body["id"], "int-1");
        assert_eq!(body["data"]["n"], 1);
    }

    #[tokio::test]
    async fn test_api_honours_method_and_sends_data() {
        let transport = Arc::new(RecordingTransport::always(204));
        let handler = HttpHandler::api(Arc::new(DeliveryExecutor::new(transport.clone())));
        let config = json!({"url": "https://api.ex.com/items/1", "method": "patch"});

        handler
            .execute(&integration(IntegrationType::Api, config), &json!({"name": "x"}))
            .await
            .unwrap();

        let req = &transport.requests()[0];
        assert_eq!(req.method, Method::PATCH);
        let body: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body, json!({"name": "x"}));
        assert!(req.header("x-signature").is_none());
    }

    #[tokio::test]
    async fn test_failure_is_delivery_error() {
        let transport = Arc::new(RecordingTransport::always(401));
        let handler = HttpHandler::webhook(Arc::new(DeliveryExecutor::new(transport)));
        let err = handler
            .execute(
                &integration(IntegrationType::Webhook, json!({"url": "https://ex.com"})),
                &json!({}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Delivery failed: HTTP 401: Unauthorized");
    }

    #[tokio::test]
    async fn test_missing_url_is_config_error() {
        let transport = Arc::new(RecordingTransport::always(200));
        let handler = HttpHandler::webhook(Arc::new(DeliveryExecutor::new(transport.clone())));
        let err = handler
            .execute(&integration(IntegrationType::Webhook, json!({})), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::Config(_)));
        assert!(transport.requests().is_empty());
    }
}
