//! Periodic purge of old delivery records

use crate::delivery_store::DeliveryStore;
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(86_400);

/// Called with the ids removed by each sweep
pub type PurgeHook = Arc<dyn Fn(&[String]) + Send + Sync>;

/// Deletes deliveries older than the retention window
///
/// Subscriptions and integrations are never touched.
pub struct RetentionSweeper {
    deliveries: Arc<DeliveryStore>,
    retention: chrono::Duration,
    interval: Duration,
    on_purge: Option<PurgeHook>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RetentionSweeper {
    pub fn new(deliveries: Arc<DeliveryStore>) -> Self {
        Self {
            deliveries,
            retention: chrono::Duration::days(i64::from(DEFAULT_RETENTION_DAYS)),
            interval: DEFAULT_SWEEP_INTERVAL,
            on_purge: None,
            task: Mutex::new(None),
        }
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention = chrono::Duration::days(i64::from(days));
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_purge_hook(mut self, hook: PurgeHook) -> Self {
        self.on_purge = Some(hook);
        self
    }

    /// Remove every delivery created before `now - retention`
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.retention;
        let purged = self.deliveries.purge_older_than(cutoff).await?;

        if !purged.is_empty() {
            if let Some(hook) = &self.on_purge {
                hook(&purged);
            }
            tracing::info!(purged = purged.len(), cutoff = %cutoff, "Purged expired deliveries");
        }
        Ok(purged.len())
    }

    /// Start the background sweep loop; a second call is a no-op
    ///
    /// The first sweep runs immediately.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.lock_task();
        if task.is_some() {
            return;
        }

        let sweeper = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = sweeper.sweep_once(Utc::now()).await {
                    tracing::error!(error = %e, "Retention sweep failed");
                }
            }
        }));

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            retention_days = self.retention.num_days(),
            "Retention sweeper started"
        );
    }

    pub fn is_running(&self) -> bool {
        self.lock_task().is_some()
    }

    pub fn stop(&self) {
        if let Some(handle) = self.lock_task().take() {
            handle.abort();
            tracing::info!("Retention sweeper stopped");
        }
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for RetentionSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
