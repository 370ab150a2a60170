//! Static catalog of supported integration types
//!
//! Each template describes the configuration an integration of that type
//! needs. The catalog is read-only and built once on first access.

use crate::error::{Result, WebhookError};
use crate::filter::resolve_path;
use crate::types::IntegrationType;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;

/// Grouping shown alongside templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateCategory {
    Http,
    Notification,
    Chat,
}

/// Catalog entry describing one integration type
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationTemplate {
    #[serde(rename = "type")]
    pub integration_type: IntegrationType,

    pub name: String,

    pub description: String,

    pub category: TemplateCategory,

    /// JSON-schema-like description of the config map
    pub config_schema: Value,

    pub default_config: Value,

    pub supported_events: Vec<String>,

    pub documentation_url: String,
}

impl IntegrationTemplate {
    /// Config keys that must be present and non-empty
    pub fn required_keys(&self) -> Vec<&str> {
        self.config_schema["required"]
            .as_array()
            .map(|keys| keys.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// HTTP methods accepted by `api` integrations
pub const API_METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];

static CATALOG: OnceLock<Vec<IntegrationTemplate>> = OnceLock::new();

/// All templates, in display order
pub fn catalog() -> &'static [IntegrationTemplate] {
    CATALOG.get_or_init(build_catalog)
}

/// Template for one integration type
pub fn template(integration_type: IntegrationType) -> Option<&'static IntegrationTemplate> {
    catalog()
        .iter()
        .find(|t| t.integration_type == integration_type)
}

/// Reject configs missing required keys or carrying malformed URLs/methods
pub fn validate_config(
    integration_type: IntegrationType,
    config: &Map<String, Value>,
) -> Result<()> {
    let template = template(integration_type).ok_or_else(|| {
        WebhookError::Config(format!("No template for integration type '{}'", integration_type))
    })?;

    for key in template.required_keys() {
        let present = match config.get(key) {
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::Null) | None => false,
            Some(_) => true,
        };
        if !present {
            return Err(WebhookError::Config(format!(
                "{} integration requires config.{}",
                integration_type, key
            )));
        }
    }

    for key in ["url", "webhookUrl"] {
        if let Some(value) = config.get(key) {
            let url = value.as_str().ok_or_else(|| {
                WebhookError::Config(format!("config.{} must be a string", key))
            })?;
            crate::registry::validate_http_url(url)?;
        }
    }

    if let Some(method) = config.get("method") {
        let valid = method
            .as_str()
            .is_some_and(|m| API_METHODS.contains(&m.to_ascii_uppercase().as_str()));
        if !valid {
            return Err(WebhookError::Config(format!(
                "config.method must be one of {}",
                API_METHODS.join(", ")
            )));
        }
    }

    Ok(())
}

/// Substitute `{{path}}` placeholders with values resolved from `data`
///
/// Unknown paths render as an empty string; non-string values render as JSON.
pub fn render(template: &str, data: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let path = after[..end].trim();
        match resolve_path(data, path) {
            Some(Value::String(s)) => out.push_str(s),
            Some(Value::Null) | None => {}
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

fn build_catalog() -> Vec<IntegrationTemplate> {
    let all_events = vec!["*".to_string()];
    vec![
        IntegrationTemplate {
            integration_type: IntegrationType::Webhook,
            name: "Webhook".to_string(),
            description: "POST a signed JSON payload to an HTTP endpoint".to_string(),
            category: TemplateCategory::Http,
            config_schema: json!({
                "type": "object",
                "required": ["url"],
                "properties": {
                    "url": {"type": "string", "format": "uri"},
                    "secret": {"type": "string"},
                    "headers": {"type": "object"}
                }
            }),
            default_config: json!({"url": "", "headers": {}}),
            supported_events: all_events.clone(),
            documentation_url: "https://docs.a3s.dev/integrations/webhook".to_string(),
        },
        IntegrationTemplate {
            integration_type: IntegrationType::Api,
            name: "REST API".to_string(),
            description: "Call an arbitrary HTTP API with a JSON body".to_string(),
            category: TemplateCategory::Http,
            config_schema: json!({
                "type": "object",
                "required": ["url"],
                "properties": {
                    "url": {"type": "string", "format": "uri"},
                    "method": {"type": "string", "enum": API_METHODS},
                    "headers": {"type": "object"},
                    "secret": {"type": "string"}
                }
            }),
            default_config: json!({"url": "", "method": "POST", "headers": {}}),
            supported_events: all_events.clone(),
            documentation_url: "https://docs.a3s.dev/integrations/api".to_string(),
        },
        IntegrationTemplate {
            integration_type: IntegrationType::Email,
            name: "Email".to_string(),
            description: "Send a templated email notification".to_string(),
            category: TemplateCategory::Notification,
            config_schema: json!({
                "type": "object",
                "required": ["to"],
                "properties": {
                    "to": {"type": ["string", "array"]},
                    "subject": {"type": "string"},
                    "template": {"type": "string"}
                }
            }),
            default_config: json!({
                "to": [],
                "subject": "{{title}}",
                "template": "{{message}}"
            }),
            supported_events: vec![
                "document.processed".to_string(),
                "document.failed".to_string(),
                "analysis.completed".to_string(),
            ],
            documentation_url: "https://docs.a3s.dev/integrations/email".to_string(),
        },
        IntegrationTemplate {
            integration_type: IntegrationType::Slack,
            name: "Slack".to_string(),
            description: "Post a message to a Slack channel via incoming webhook".to_string(),
            category: TemplateCategory::Chat,
            config_schema: json!({
                "type": "object",
                "required": ["webhookUrl"],
                "properties": {
                    "webhookUrl": {"type": "string", "format": "uri"},
                    "channel": {"type": "string"},
                    "username": {"type": "string"},
                    "template": {"type": "string"}
                }
            }),
            default_config: json!({"webhookUrl": "", "template": "{{message}}"}),
            supported_events: all_events.clone(),
            documentation_url: "https://api.slack.com/messaging/webhooks".to_string(),
        },
        IntegrationTemplate {
            integration_type: IntegrationType::Discord,
            name: "Discord".to_string(),
            description: "Post a message to a Discord channel via webhook".to_string(),
            category: TemplateCategory::Chat,
            config_schema: json!({
                "type": "object",
                "required": ["webhookUrl"],
                "properties": {
                    "webhookUrl": {"type": "string", "format": "uri"},
                    "username": {"type": "string"},
                    "template": {"type": "string"}
                }
            }),
            default_config: json!({"webhookUrl": "", "template": "{{message}}"}),
            supported_events: all_events.clone(),
            documentation_url: "https://discord.com/developers/docs/resources/webhook".to_string(),
        },
        IntegrationTemplate {
            integration_type: IntegrationType::Teams,
            name: "Microsoft Teams".to_string(),
            description: "Post a message card to a Teams channel connector".to_string(),
            category: TemplateCategory::Chat,
            config_schema: json!({
                "type": "object",
                "required": ["webhookUrl"],
                "properties": {
                    "webhookUrl": {"type": "string", "format": "uri"},
                    "title": {"type": "string"},
                    "template": {"type": "string"}
                }
            }),
            default_config: json!({"webhookUrl": "", "template": "{{message}}"}),
            supported_events: all_events,
            documentation_url:
                "https://learn.microsoft.com/microsoftteams/platform/webhooks-and-connectors"
                    .to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_catalog_covers_every_type() {
        for t in IntegrationType::ALL {
            let template = template(t).unwrap();
            assert_eq!(template.integration_type, t);
            assert!(!template.required_keys().is_empty());
        }
        assert_eq!(catalog().len(), IntegrationType::ALL.len());
    }

    #[test]
    fn test_template_serialization() {
        let json = serde_json::to_value(template(IntegrationType::Slack).unwrap()).unwrap();
        assert_eq!(json["type"], "slack");
        assert_eq!(json["category"], "chat");
        assert!(json["documentationUrl"].as_str().unwrap().starts_with("https://"));
        assert_eq!(json["configSchema"]["required"][0], "webhookUrl");
    }

    #[test]
    fn test_validate_config_required_keys() {
        let webhook = config(json!({"url": "https://ex.com"}));
        assert!(validate_config(IntegrationType::Webhook, &webhook).is_ok());

        let err = validate_config(IntegrationType::Webhook, &config(json!({}))).unwrap_err();
        assert!(err.to_string().contains("config.url"));

        let err = validate_config(IntegrationType::Email, &config(json!({"to": []}))).unwrap_err();
        assert!(matches!(err, WebhookError::Config(_)));

        let email = config(json!({"to": "ops@ex.com"}));
        assert!(validate_config(IntegrationType::Email, &email).is_ok());
    }

    #[test]
    fn test_validate_config_urls_and_methods() {
        let bad_url = config(json!({"webhookUrl": "ftp://ex.com"}));
        assert!(validate_config(IntegrationType::Slack, &bad_url).is_err());

        let bad_method = config(json!({"url": "https://ex.com", "method": "TRACE"}));
        assert!(validate_config(IntegrationType::Api, &bad_method).is_err());

        let ok = config(json!({"url": "https://ex.com", "method": "put"}));
        assert!(validate_config(IntegrationType::Api, &ok).is_ok());
    }

    #[test]
    fn test_render_placeholders() {
        let data = json!({"title": "Done", "doc": {"pages": 4}, "none": null});
        assert_eq!(render("{{title}}: {{ doc.pages }} pages", &data), "Done: 4 pages");
        assert_eq!(render("[{{missing}}][{{none}}]", &data), "[][]");
        assert_eq!(render("no placeholders", &data), "no placeholders");
        assert_eq!(render("open {{title", &data), "open {{title");
    }
}
