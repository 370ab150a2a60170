//! Timer abstraction for delayed work
//!
//! The engine never sleeps directly; it asks a `Scheduler` to run a task
//! after a delay and keeps the returned `CancelToken`. `TokioScheduler`
//! uses real time. `ManualScheduler` keeps a virtual clock that tests
//! advance explicitly, so retry schedules can be checked without waiting.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;

/// Work run when a timer fires
pub type Task = BoxFuture<'static, ()>;

/// Runs tasks after a delay
pub trait Scheduler: Send + Sync {
    /// Arm a timer; the task runs once unless the token is cancelled first
    fn after(&self, delay: Duration, task: Task) -> CancelToken;
}

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

struct TimerState {
    state: AtomicU8,
    sleeper: Mutex<Option<AbortHandle>>,
}

/// Handle to an armed timer
///
/// Cancelling only prevents a task that has not started; a task already
/// running is never interrupted.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TimerState>,
}

impl CancelToken {
    fn new() -> Self {
        Self {
            inner: Arc::new(TimerState {
                state: AtomicU8::new(ARMED),
                sleeper: Mutex::new(None),
            }),
        }
    }

    /// Cancel the timer; `true` if it had not fired yet
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .inner
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            if let Ok(mut sleeper) = self.inner.sleeper.lock() {
                if let Some(handle) = sleeper.take() {
                    handle.abort();
                }
            }
        }
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn has_fired(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == FIRED
    }

    fn try_fire(&self) -> bool {
        self.inner
            .state
            .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_sleeper(&self, handle: AbortHandle) {
        if let Ok(mut sleeper) = self.inner.sleeper.lock() {
            *sleeper = Some(handle);
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            ARMED => "armed",
            FIRED => "fired",
            _ => "cancelled",
        };
        f.debug_struct("CancelToken").field("state", &state).finish()
    }
}

// ─── Tokio ───────────────────────────────────────────────────────

/// Real-time scheduler backed by `tokio::time::sleep`
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Default, Clone)]
pub struct TokioScheduler;

impl TokioScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, task: Task) -> CancelToken {
        let token = CancelToken::new();
        let timer = token.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if timer.try_fire() {
                task.await;
            }
        });
        token.set_sleeper(handle.abort_handle());
        token
    }
}

// ─── Manual (virtual time) ───────────────────────────────────────

struct ManualEntry {
    due: Duration,
    seq: u64,
    token: CancelToken,
    task: Task,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    seq: u64,
    entries: Vec<ManualEntry>,
    requested: Vec<Duration>,
}

/// Virtual-time scheduler for deterministic tests
///
/// Timers fire only inside `advance`/`fire_next`, in due order (ties in
/// arming order), each task awaited to completion before the next.
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since creation
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Every delay ever requested, in arming order
    pub fn delays(&self) -> Vec<Duration> {
        self.lock().requested.clone()
    }

    /// Timers that are still armed
    pub fn pending(&self) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|e| !e.token.is_cancelled())
            .count()
    }

    /// Move the clock forward, firing every timer that becomes due
    ///
    /// Timers armed by fired tasks are also run if they fall due within
    /// the window. Returns the number of tasks run.
    pub async fn advance(&self, by: Duration) -> usize {
        let target = self.now() + by;
        let mut fired = 0;
        while let Some(entry) = self.pop_due(Some(target)) {
            if entry.token.try_fire() {
                entry.task.await;
                fired += 1;
            }
        }
        self.lock().now = target;
        fired
    }

    /// Jump to the earliest armed timer and run it; `false` if none
    pub async fn fire_next(&self) -> bool {
        while let Some(entry) = self.pop_due(None) {
            if entry.token.try_fire() {
                entry.task.await;
                return true;
            }
        }
        false
    }

    /// Remove the earliest entry due at or before `limit` and move the clock to it
    fn pop_due(&self, limit: Option<Duration>) -> Option<ManualEntry> {
        let mut state = self.lock();
        state.entries.retain(|e| !e.token.is_cancelled());
        let index = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| limit.map_or(true, |l| e.due <= l))
            .min_by_key(|(_, e)| (e.due, e.seq))
            .map(|(i, _)| i)?;
        let entry = state.entries.swap_remove(index);
        if entry.due > state.now {
            state.now = entry.due;
        }
        Some(entry)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        // A panicking test task must not wedge every later assertion
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Scheduler for ManualScheduler {
    fn after(&self, delay: Duration, task: Task) -> CancelToken {
        let token = CancelToken::new();
        let mut state = self.lock();
        let due = state.now + delay;
        let seq = state.seq;
        state.seq += 1;
        state.requested.push(delay);
        state.entries.push(ManualEntry {
            due,
            seq,
            token: token.clone(),
            task,
        });
        token
    }
}
