//! Error types for a3s-webhook

use thiserror::Error;

/// Errors that can occur in the webhook engine
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Invalid subscription, integration, or engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Outbound delivery failure (network, timeout, non-2xx)
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Snapshot storage read/write failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Record not found
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Operation not allowed in the record's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Trigger queue is at capacity and the overflow policy rejects new events
    #[error("Event queue is full (capacity {0})")]
    QueueFull(usize),

    /// The dispatcher has been shut down
    #[error("Dispatcher is shut down")]
    Shutdown,

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WebhookError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Result type alias for webhook engine operations
pub type Result<T> = std::result::Result<T, WebhookError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WebhookError::not_found("Subscription", "sub-1");
        assert_eq!(err.to_string(), "Subscription not found: sub-1");

        let err = WebhookError::QueueFull(16);
        assert_eq!(err.to_string(), "Event queue is full (capacity 16)");

        let err = WebhookError::Config("url is required".to_string());
        assert_eq!(err.to_string(), "Configuration error: url is required");
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: WebhookError = parse.unwrap_err().into();
        assert!(matches!(err, WebhookError::Serialization(_)));
    }
}
