//! Engine configuration
//!
//! Loaded from JSON with camelCase keys; every field has a default so a
//! partial (or empty) document is valid.

use crate::dispatcher::DispatcherOptions;
use crate::error::{Result, WebhookError};
use crate::queue::OverflowPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Trigger queue capacity (default: 1024)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Behavior when the trigger queue is full (default: block)
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// Per-request HTTP timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Product name in `User-Agent: <product>-Webhook/1.0` (default: A3S)
    #[serde(default = "default_user_agent_product")]
    pub user_agent_product: String,

    /// Ceiling on a single backoff delay; `null` disables it (default: 1 hour)
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_ms: Option<u64>,

    /// Bytes of response body kept on a delivery (default: 1000)
    #[serde(default = "default_response_body_limit")]
    pub response_body_limit: usize,

    /// Age after which deliveries are purged (default: 30)
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Seconds between retention sweeps (default: 86400)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Snapshot directory; in-memory state when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

fn default_queue_capacity() -> usize {
    1024
}
fn default_request_timeout() -> u64 {
    30
}
fn default_user_agent_product() -> String {
    "A3S".to_string()
}
fn default_max_retry_delay() -> Option<u64> {
    Some(3_600_000)
}
fn default_response_body_limit() -> usize {
    1000
}
fn default_retention_days() -> u32 {
    30
}
fn default_sweep_interval() -> u64 {
    86_400
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            overflow_policy: OverflowPolicy::default(),
            request_timeout_secs: default_request_timeout(),
            user_agent_product: default_user_agent_product(),
            max_retry_delay_ms: default_max_retry_delay(),
            response_body_limit: default_response_body_limit(),
            retention_days: default_retention_days(),
            sweep_interval_secs: default_sweep_interval(),
            state_dir: None,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| WebhookError::Config(format!("Invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            WebhookError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(WebhookError::Config("queueCapacity must be at least 1".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(WebhookError::Config("requestTimeoutSecs must be at least 1".to_string()));
        }
        if self.user_agent_product.trim().is_empty()
            || !self.user_agent_product.chars().all(|c| c.is_ascii_graphic())
        {
            return Err(WebhookError::Config(format!(
                "userAgentProduct must be a non-empty token, got '{}'",
                self.user_agent_product
            )));
        }
        if self.max_retry_delay_ms == Some(0) {
            return Err(WebhookError::Config(
                "maxRetryDelayMs must be positive or null".to_string(),
            ));
        }
        if self.retention_days == 0 {
            return Err(WebhookError::Config("retentionDays must be at least 1".to_string()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(WebhookError::Config("sweepIntervalSecs must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_retry_delay(&self) -> Option<Duration> {
        self.max_retry_delay_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn dispatcher_options(&self) -> DispatcherOptions {
        DispatcherOptions {
            queue_capacity: self.queue_capacity,
            overflow_policy: self.overflow_policy,
            max_retry_delay: self.max_retry_delay(),
        }
    }
}
