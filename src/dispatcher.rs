//! Event dispatch, delivery attempts, and retry orchestration
//!
//! `EventDispatcher` accepts events through a bounded queue drained by a
//! single background worker. For each event it fans out one delivery per
//! matching subscription, concurrently, and waits for the fan-out before
//! taking the next event. Failed attempts are handed to the
//! `RetryScheduler`, whose timers re-enter the same attempt path.
//!
//! All attempts for one delivery (first attempt, timer-driven retries,
//! manual retries) run under that delivery's async lock, so they are
//! strictly sequential.
//!
//! The persisted `status` and `nextRetryAt` are the retry schedule of
//! record. `start` re-arms what a previous engine left unfinished, and
//! `shutdown` stops arming without touching the records.

use crate::delivery_store::{DeliveryStats, DeliveryStore};
use crate::error::{Result, WebhookError};
use crate::executor::{AttemptOutcome, DeliveryExecutor};
use crate::queue::{EventQueue, OverflowPolicy};
use crate::registry::SubscriptionRegistry;
use crate::retry::{RetryScheduler, DEFAULT_MAX_RETRY_DELAY};
use crate::scheduler::Scheduler;
use crate::signer;
use crate::types::{Delivery, DeliveryQuery, DeliveryStatus, Event, Page, Subscription};
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Event type used by `test_subscription`
pub const TEST_EVENT_TYPE: &str = "webhook.test";

/// Queue and retry settings for a dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub max_retry_delay: Option<Duration>,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            overflow_policy: OverflowPolicy::Block,
            max_retry_delay: Some(DEFAULT_MAX_RETRY_DELAY),
        }
    }
}

struct DispatchCore {
    registry: Arc<SubscriptionRegistry>,
    deliveries: Arc<DeliveryStore>,
    executor: Arc<DeliveryExecutor>,
    retries: RetryScheduler,
    queue: EventQueue,
    delivery_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Events accepted by `trigger`
    accepted: AtomicU64,
    /// Events processed or evicted by the worker side
    processed: watch::Sender<u64>,
}

/// Event dispatcher driving deliveries and retries
pub struct EventDispatcher {
    core: Arc<DispatchCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        deliveries: Arc<DeliveryStore>,
        executor: Arc<DeliveryExecutor>,
        scheduler: Arc<dyn Scheduler>,
        options: DispatcherOptions,
    ) -> Self {
        let retries = RetryScheduler::new(scheduler).with_max_delay(options.max_retry_delay);
        let (processed, _) = watch::channel(0);
        Self {
            core: Arc::new(DispatchCore {
                registry,
                deliveries,
                executor,
                retries,
                queue: EventQueue::new(options.queue_capacity, options.overflow_policy),
                delivery_locks: Mutex::new(HashMap::new()),
                accepted: AtomicU64::new(0),
                processed,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the background worker and re-arm recovered retries
    ///
    /// Calling it again is a no-op.
    pub fn start(&self) {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return;
        }
        let resumed = self.core.resume(self.core.deliveries.take_recovered());
        if resumed > 0 {
            tracing::info!(resumed, "Resumed unfinished deliveries");
        }

        let core = self.core.clone();
        *worker = Some(tokio::spawn(async move {
            tracing::info!("Event dispatcher worker started");
            while let Some(event) = core.queue.pop().await {
                core.clone().process_event(event).await;
                core.processed.send_modify(|n| *n += 1);
            }
            tracing::info!("Event dispatcher worker stopped");
        }));
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker).as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Enqueue an event for asynchronous dispatch and return it
    ///
    /// Succeeds regardless of how the resulting deliveries turn out.
    pub async fn trigger(&self, event: Event) -> Result<Event> {
        let evicted = self.core.queue.push(event.clone()).await?;
        self.core.accepted.fetch_add(1, Ordering::SeqCst);
        if evicted.is_some() {
            self.core.processed.send_modify(|n| *n += 1);
        }

        tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Event triggered");
        Ok(event)
    }

    /// Wait until every event accepted so far has been processed
    ///
    /// Requires a running worker (`start`).
    pub async fn flush(&self) {
        let target = self.core.accepted.load(Ordering::SeqCst);
        let mut rx = self.core.processed.subscribe();
        // Sender lives in core, so the channel cannot close while we wait
        let _ = rx.wait_for(|n| *n >= target).await;
    }

    /// Dispatch an event immediately, bypassing the queue
    ///
    /// Returns the deliveries as they stand after their first attempt.
    pub async fn dispatch(&self, event: Event) -> Vec<Delivery> {
        self.core.clone().process_event(event).await
    }

    /// Send a synthetic `webhook.test` event to one subscription
    ///
    /// Ignores the subscription's event list, filter, and active flag.
    pub async fn test_subscription(&self, subscription_id: &str) -> Result<Delivery> {
        let subscription = self
            .core
            .registry
            .get(subscription_id)
            .await
            .ok_or_else(|| WebhookError::not_found("Subscription", subscription_id))?;

        let event = Event::new(
            TEST_EVENT_TYPE,
            json!({
                "message": "This is a test webhook delivery",
                "subscriptionId": subscription.id,
            }),
        )
        .with_source("webhook-test");

        self.core.clone().deliver(subscription, event).await
    }

    /// Re-attempt a delivery now, outside its backoff schedule
    ///
    /// Does not add to `attempts`. Rejected for successful deliveries.
    pub async fn retry_delivery(&self, delivery_id: &str) -> Result<Delivery> {
        self.core.manual_retry(delivery_id).await
    }

    /// Delete a delivery record, cancelling its retry timer
    pub async fn delete_delivery(&self, delivery_id: &str) -> Result<Delivery> {
        self.core.retries.cancel(delivery_id);
        let removed = self.core.deliveries.delete(delivery_id).await?;
        self.core.forget_lock(delivery_id);
        tracing::info!(delivery_id, "Delivery deleted");
        Ok(removed)
    }

    /// Hard-delete a subscription, cancelling timers of its deliveries
    ///
    /// Delivery records are kept.
    pub async fn delete_subscription(&self, subscription_id: &str) -> Result<Subscription> {
        let removed = self.core.registry.delete(subscription_id).await?;
        let ids = self.core.deliveries.ids_for_subscription(subscription_id).await;
        let cancelled = self.core.retries.cancel_all(&ids);
        if cancelled > 0 {
            tracing::info!(subscription_id, cancelled, "Cancelled pending retries");
        }
        Ok(removed)
    }

    /// Forget per-delivery state for records removed elsewhere (retention)
    pub fn release_deliveries(&self, delivery_ids: &[String]) {
        for id in delivery_ids {
            self.core.retries.cancel(id);
            self.core.forget_lock(id);
        }
    }

    pub async fn get_delivery(&self, delivery_id: &str) -> Option<Delivery> {
        self.core.deliveries.get(delivery_id).await
    }

    pub async fn list_deliveries(&self, query: &DeliveryQuery) -> Page<Delivery> {
        self.core.deliveries.query(query).await
    }

    pub async fn delivery_stats(&self) -> DeliveryStats {
        self.core.deliveries.stats().await
    }

    /// Retry timers currently waiting
    pub fn pending_retries(&self) -> usize {
        self.core.retries.pending_count()
    }

    pub fn has_pending_retry(&self, delivery_id: &str) -> bool {
        self.core.retries.is_armed(delivery_id)
    }

    pub async fn queue_len(&self) -> usize {
        self.core.queue.len().await
    }

    pub fn verify_signature(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        signer::verify(payload, signature, secret)
    }

    /// Stop accepting events, drain the queue, and cancel waiting retries
    ///
    /// Retrying deliveries keep their status and `nextRetryAt`; the next
    /// engine built on the same state resumes them.
    pub async fn shutdown(&self) {
        self.core.queue.close().await;

        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Event dispatcher worker panicked");
            }
        }

        let cancelled = self.core.retries.close();
        tracing::info!(cancelled_retries = cancelled, "Event dispatcher shut down");
    }
}

impl DispatchCore {
    /// Arm the next attempt of deliveries left unfinished by a previous run
    fn resume(self: &Arc<Self>, deliveries: Vec<Delivery>) -> usize {
        let now = Utc::now();
        let mut resumed = 0;
        for delivery in deliveries {
            let (attempt, delay) = match delivery.status {
                DeliveryStatus::Pending => (1, Duration::ZERO),
                DeliveryStatus::Retrying => {
                    let delay = delivery
                        .next_retry_at
                        .and_then(|at| (at - now).to_std().ok())
                        .unwrap_or(Duration::ZERO);
                    (delivery.attempts + 1, delay)
                }
                _ => continue,
            };
            tracing::debug!(
                delivery_id = %delivery.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Resuming delivery"
            );
            let task = self.clone().run_attempt(delivery.id.clone(), attempt);
            if self.retries.arm(&delivery.id, delay, task) {
                resumed += 1;
            }
        }
        resumed
    }

    async fn process_event(self: Arc<Self>, event: Event) -> Vec<Delivery> {
        let subscriptions = self.registry.matching(&event).await;
        if subscriptions.is_empty() {
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                "No matching subscriptions"
            );
            return Vec::new();
        }

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            subscriptions = subscriptions.len(),
            "Dispatching event"
        );

        let fan_out = subscriptions
            .into_iter()
            .map(|sub| self.clone().deliver(sub, event.clone()));

        join_all(fan_out)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(delivery) => Some(delivery),
                Err(e) => {
                    tracing::error!(event_id = %event.id, error = %e, "Failed to create delivery");
                    None
                }
            })
            .collect()
    }

    /// Create a pending delivery and run its first attempt
    async fn deliver(
        self: Arc<Self>,
        subscription: Subscription,
        event: Event,
    ) -> Result<Delivery> {
        let delivery = self
            .deliveries
            .insert(Delivery::pending(&subscription, &event))
            .await?;
        let id = delivery.id.clone();

        self.clone().run_attempt(id.clone(), 1).await;

        self.deliveries
            .get(&id)
            .await
            .ok_or_else(|| WebhookError::not_found("Delivery", id))
    }

    /// Attempt `attempt` of a delivery; boxed because timers re-enter it
    fn run_attempt(self: Arc<Self>, delivery_id: String, attempt: u32) -> BoxFuture<'static, ()> {
        async move {
            let delivery_lock = self.lock_for(&delivery_id);
            let _guard = delivery_lock.lock().await;

            let Some(delivery) = self.deliveries.get(&delivery_id).await else {
                tracing::debug!(delivery_id = %delivery_id, "Delivery gone, skipping attempt");
                return;
            };
            if delivery.status.is_terminal() || delivery.attempts >= attempt {
                tracing::debug!(
                    delivery_id = %delivery_id,
                    attempt,
                    status = %delivery.status,
                    "Stale attempt skipped"
                );
                return;
            }

            let Some(subscription) = self.registry.get(&delivery.subscription_id).await else {
                tracing::debug!(
                    delivery_id = %delivery_id,
                    subscription_id = %delivery.subscription_id,
                    "Subscription gone, skipping attempt"
                );
                return;
            };

            if attempt > 1 && !subscription.active {
                self.abandon_inactive(&delivery_id, &subscription).await;
                return;
            }

            let outcome = self.executor.attempt(&subscription, &delivery).await;
            self.record_attempt(&delivery_id, &subscription, attempt, outcome)
                .await;
        }
        .boxed()
    }

    async fn record_attempt(
        self: &Arc<Self>,
        delivery_id: &str,
        subscription: &Subscription,
        attempt: u32,
        outcome: AttemptOutcome,
    ) {
        let now = Utc::now();
        let policy = &subscription.retry_policy;
        let retry_delay = (!outcome.success && attempt < policy.max_attempts())
            .then(|| self.retries.delay_for(policy, attempt));

        let status = match (outcome.success, retry_delay) {
            (true, _) => DeliveryStatus::Success,
            (false, Some(_)) => DeliveryStatus::Retrying,
            (false, None) => DeliveryStatus::Failed,
        };
        let next_retry_at = retry_delay.map(|d| add_std(now, d));

        let updated = self
            .deliveries
            .update(delivery_id, |d| {
                apply_outcome(d, &outcome, now);
                d.attempts = attempt;
                d.status = status;
                d.next_retry_at = next_retry_at;
            })
            .await;

        let updated = match updated {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(delivery_id, attempt, error = %e, "Failed to record attempt");
                return;
            }
        };

        match (status, retry_delay) {
            (DeliveryStatus::Retrying, Some(delay)) => {
                tracing::warn!(
                    delivery_id,
                    subscription_id = %subscription.id,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = updated.error.as_deref().unwrap_or_default(),
                    "Webhook delivery failed, retry scheduled"
                );
                let next = self.clone().run_attempt(delivery_id.to_string(), attempt + 1);
                self.retries.arm(delivery_id, delay, next);
            }
            (DeliveryStatus::Success, _) => {
                tracing::info!(
                    delivery_id,
                    subscription_id = %subscription.id,
                    attempt,
                    status = ?updated.response_status,
                    duration_ms = outcome.duration_ms,
                    "Webhook delivered"
                );
            }
            _ => {
                tracing::warn!(
                    delivery_id,
                    subscription_id = %subscription.id,
                    attempts = attempt,
                    error = updated.error.as_deref().unwrap_or_default(),
                    "Webhook delivery failed permanently"
                );
            }
        }
    }

    /// A retry fired for a subscription that was deactivated meanwhile
    async fn abandon_inactive(&self, delivery_id: &str, subscription: &Subscription) {
        let result = self
            .deliveries
            .update(delivery_id, |d| {
                d.status = DeliveryStatus::Failed;
                d.next_retry_at = None;
                d.error = Some("Subscription is inactive".to_string());
            })
            .await;

        match result {
            Ok(_) => tracing::info!(
                delivery_id,
                subscription_id = %subscription.id,
                "Retry abandoned for inactive subscription"
            ),
            Err(e) => tracing::error!(delivery_id, error = %e, "Failed to abandon retry"),
        }
    }

    async fn manual_retry(self: &Arc<Self>, delivery_id: &str) -> Result<Delivery> {
        let delivery_lock = self.lock_for(delivery_id);
        let _guard = delivery_lock.lock().await;

        let delivery = self
            .deliveries
            .get(delivery_id)
            .await
            .ok_or_else(|| WebhookError::not_found("Delivery", delivery_id))?;
        if delivery.status == DeliveryStatus::Success {
            return Err(WebhookError::InvalidState(format!(
                "Delivery {} already succeeded",
                delivery_id
            )));
        }
        let subscription = self
            .registry
            .get(&delivery.subscription_id)
            .await
            .ok_or_else(|| WebhookError::not_found("Subscription", &delivery.subscription_id))?;

        let outcome = self.executor.attempt(&subscription, &delivery).await;
        let now = Utc::now();

        if outcome.success {
            self.retries.cancel(delivery_id);
        }
        // A timer that already fired is waiting on this lock; the record decides
        let keeps_schedule = !outcome.success
            && delivery.status == DeliveryStatus::Retrying
            && delivery.next_retry_at.is_some();

        let updated = self
            .deliveries
            .update(delivery_id, |d| {
                apply_outcome(d, &outcome, now);
                d.attempts = d.attempts.max(1);
                if outcome.success {
                    d.status = DeliveryStatus::Success;
                    d.next_retry_at = None;
                } else if !keeps_schedule {
                    d.status = DeliveryStatus::Failed;
                    d.next_retry_at = None;
                }
            })
            .await?;

        tracing::info!(
            delivery_id,
            success = outcome.success,
            status = %updated.status,
            "Manual retry completed"
        );
        Ok(updated)
    }

    fn lock_for(&self, delivery_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.delivery_locks)
            .entry(delivery_id.to_string())
            .or_default()
            .clone()
    }

    fn forget_lock(&self, delivery_id: &str) {
        lock(&self.delivery_locks).remove(delivery_id);
    }
}

fn apply_outcome(delivery: &mut Delivery, outcome: &AttemptOutcome, now: DateTime<Utc>) {
    delivery.last_attempt_at = Some(now);
    delivery.response_status = outcome.status_code;
    delivery.response_body = outcome.response_body.clone();
    delivery.error = outcome.error.clone();
    delivery.duration_ms = Some(outcome.duration_ms);
}

/// `at + delay`, saturating at the latest representable instant
fn add_std(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
