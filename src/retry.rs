//! Retry timers keyed by delivery id
//!
//! `RetryScheduler` computes exponential backoff and keeps at most one
//! armed timer per delivery. A timer removes its own entry when it fires,
//! so `is_armed` reflects only timers that are still waiting. Once closed
//! the scheduler arms nothing; persisted `nextRetryAt` values carry the
//! schedule to the next engine.

use crate::scheduler::{CancelToken, Scheduler, Task};
use crate::types::RetryPolicy;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default ceiling on a single backoff delay (1 hour)
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Hard ceiling applied even when the configurable cap is disabled (100 years)
///
/// Keeps `nextRetryAt` representable and timer deadlines from overflowing.
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(100 * 365 * 86_400);

/// `base * multiplier^(attempt-1)`, capped by `cap` and `MAX_BACKOFF_DELAY`
///
/// `attempt` is the number of the attempt that just failed (1-based).
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, cap: Option<Duration>) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
    let millis = policy.base_delay_ms as f64 * policy.backoff_multiplier.powi(exponent);

    let delay = if millis.is_finite() && millis >= 0.0 && millis < u64::MAX as f64 {
        Duration::from_millis(millis.round() as u64)
    } else {
        MAX_BACKOFF_DELAY
    };

    let delay = delay.min(MAX_BACKOFF_DELAY);
    match cap {
        Some(cap) => delay.min(cap),
        None => delay,
    }
}

type TimerMap = HashMap<String, (u64, CancelToken)>;

/// One armed timer per delivery id on top of a `Scheduler`
pub struct RetryScheduler {
    scheduler: Arc<dyn Scheduler>,
    timers: Arc<Mutex<TimerMap>>,
    generation: AtomicU64,
    max_delay: Option<Duration>,
    closed: AtomicBool,
}

impl RetryScheduler {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            max_delay: Some(DEFAULT_MAX_RETRY_DELAY),
            closed: AtomicBool::new(false),
        }
    }

    /// Set the backoff ceiling (`None` disables it)
    pub fn with_max_delay(mut self, max_delay: Option<Duration>) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    /// Delay before the retry that follows failed attempt `attempt`
    pub fn delay_for(&self, policy: &RetryPolicy, attempt: u32) -> Duration {
        backoff_delay(policy, attempt, self.max_delay)
    }

    /// Arm a timer for a delivery, replacing any timer already armed for it
    ///
    /// Returns `false` (dropping `task`) once the scheduler is closed.
    pub fn arm(&self, delivery_id: &str, delay: Duration, task: Task) -> bool {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let timers = self.timers.clone();
        let key = delivery_id.to_string();

        let wrapped = async move {
            {
                let mut timers = lock(&timers);
                if timers.get(&key).is_some_and(|(g, _)| *g == generation) {
                    timers.remove(&key);
                }
            }
            task.await;
        }
        .boxed();

        // Held across `after` so a zero-delay timer cannot fire before its entry exists
        let mut timers = lock(&self.timers);
        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!(delivery_id, "Retry scheduler closed, timer not armed");
            return false;
        }
        let token = self.scheduler.after(delay, wrapped);
        if let Some((_, previous)) = timers.insert(delivery_id.to_string(), (generation, token)) {
            previous.cancel();
        }

        tracing::debug!(delivery_id, delay_ms = delay.as_millis() as u64, "Retry timer armed");
        true
    }

    /// Cancel a delivery's timer; `true` if one was waiting
    pub fn cancel(&self, delivery_id: &str) -> bool {
        let removed = lock(&self.timers).remove(delivery_id);
        match removed {
            Some((_, token)) => {
                let cancelled = token.cancel();
                if cancelled {
                    tracing::debug!(delivery_id, "Retry timer cancelled");
                }
                cancelled
            }
            None => false,
        }
    }

    /// Cancel timers for several deliveries, returning how many were waiting
    pub fn cancel_all<'a>(&self, delivery_ids: impl IntoIterator<Item = &'a String>) -> usize {
        delivery_ids.into_iter().filter(|id| self.cancel(id)).count()
    }

    pub fn is_armed(&self, delivery_id: &str) -> bool {
        lock(&self.timers).contains_key(delivery_id)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.timers).len()
    }

    /// Cancel every waiting timer and refuse to arm new ones
    pub fn close(&self) -> usize {
        let drained: Vec<(u64, CancelToken)> = {
            let mut timers = lock(&self.timers);
            self.closed.store(true, Ordering::SeqCst);
            timers.drain().map(|(_, t)| t).collect()
        };
        drained.into_iter().filter(|(_, token)| token.cancel()).count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn lock(timers: &Mutex<TimerMap>) -> MutexGuard<'_, TimerMap> {
    timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use std::sync::atomic::AtomicUsize;

    fn policy(base: u64, mult: f64) -> RetryPolicy {
        RetryPolicy::new(3, base, mult)
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Task {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    }

    #[test]
    fn test_backoff_law() {
        let p = policy(1000, 2.0);
        assert_eq!(backoff_delay(&p, 1, None), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&p, 2, None), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&p, 3, None), Duration::from_millis(4000));

        let p = policy(100, 3.0);
        assert_eq!(backoff_delay(&p, 3, None), Duration::from_millis(900));

        let flat = policy(500, 1.0);
        assert_eq!(backoff_delay(&flat, 10, None), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_cap() {
        let p = policy(1000, 10.0);
        let cap = Some(Duration::from_secs(60));
        assert_eq!(backoff_delay(&p, 2, cap), Duration::from_secs(10));
        assert_eq!(backoff_delay(&p, 3, cap), Duration::from_secs(60));
        assert_eq!(backoff_delay(&p, 400, cap), Duration::from_secs(60));
        assert_eq!(backoff_delay(&p, 400, None), MAX_BACKOFF_DELAY);
    }

    #[test]
    fn test_uncapped_backoff_stays_representable() {
        let huge = RetryPolicy::new(3, u64::MAX / 2, 1e12);
        let delay = backoff_delay(&huge, 3, None);
        assert_eq!(delay, MAX_BACKOFF_DELAY);

        let now = chrono::Utc::now();
        let delay = chrono::Duration::from_std(delay).unwrap();
        assert!(now.checked_add_signed(delay).is_some());
    }

    #[tokio::test]
    async fn test_arm_fire_removes_entry() {
        let manual = Arc::new(ManualScheduler::new());
        let retries = RetryScheduler::new(manual.clone());
        let count = Arc::new(AtomicUsize::new(0));

        retries.arm("dlv-1", Duration::from_secs(1), counting(&count));
        assert!(retries.is_armed("dlv-1"));
        assert_eq!(retries.pending_count(), 1);

        manual.advance(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!retries.is_armed("dlv-1"));
    }

    #[tokio::test]
    async fn test_rearm_replaces_previous_timer() {
        let manual = Arc::new(ManualScheduler::new());
        let retries = RetryScheduler::new(manual.clone());
        let count = Arc::new(AtomicUsize::new(0));

        retries.arm("dlv-1", Duration::from_secs(1), counting(&count));
        retries.arm("dlv-1", Duration::from_secs(5), counting(&count));
        assert_eq!(retries.pending_count(), 1);

        manual.advance(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel() {
        let manual = Arc::new(ManualScheduler::new());
        let retries = RetryScheduler::new(manual.clone());
        let count = Arc::new(AtomicUsize::new(0));

        retries.arm("dlv-1", Duration::from_secs(1), counting(&count));
        retries.arm("dlv-2", Duration::from_secs(1), counting(&count));
        retries.arm("dlv-3", Duration::from_secs(1), counting(&count));

        assert!(retries.cancel("dlv-1"));
        assert!(!retries.cancel("dlv-1"));
        let ids = vec!["dlv-2".to_string(), "dlv-9".to_string()];
        assert_eq!(retries.cancel_all(&ids), 1);

        manual.advance(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(retries.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_cancels_everything() {
        let manual = Arc::new(ManualScheduler::new());
        let retries = RetryScheduler::new(manual.clone());
        let count = Arc::new(AtomicUsize::new(0));
        for i in 0..4 {
            retries.arm(&format!("dlv-{}", i), Duration::from_secs(1), counting(&count));
        }
        assert_eq!(retries.close(), 4);
        manual.advance(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_refuses_new_timers() {
        let manual = Arc::new(ManualScheduler::new());
        let retries = RetryScheduler::new(manual.clone());
        let count = Arc::new(AtomicUsize::new(0));

        assert!(retries.arm("dlv-1", Duration::from_secs(1), counting(&count)));
        assert_eq!(retries.close(), 1);
        assert!(retries.is_closed());

        assert!(!retries.arm("dlv-2", Duration::from_secs(1), counting(&count)));
        assert!(!retries.is_armed("dlv-2"));
        assert_eq!(manual.pending(), 0);

        manual.advance(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
