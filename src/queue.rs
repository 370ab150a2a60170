//! Bounded trigger queue between producers and the dispatch worker

use crate::error::{Result, WebhookError};
use crate::types::Event;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

/// What `push` does when the queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Wait for the worker to free a slot
    #[default]
    Block,
    /// Evict the oldest queued event to make room
    DropOldest,
    /// Fail with `WebhookError::QueueFull`
    Reject,
}

struct QueueState {
    items: VecDeque<Event>,
    closed: bool,
    dropped: u64,
}

/// Bounded FIFO of events awaiting dispatch
pub struct EventQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: OverflowPolicy,
    not_empty: Notify,
    not_full: Notify,
}

impl EventQueue {
    /// Capacity is clamped to at least 1
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
                dropped: 0,
            }),
            capacity,
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Enqueue an event, returning the event evicted under `DropOldest`
    pub async fn push(&self, event: Event) -> Result<Option<Event>> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(WebhookError::Shutdown);
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(event);
                    self.not_empty.notify_one();
                    return Ok(None);
                }
                match self.policy {
                    OverflowPolicy::Reject => return Err(WebhookError::QueueFull(self.capacity)),
                    OverflowPolicy::DropOldest => {
                        let evicted = state.items.pop_front();
                        state.items.push_back(event);
                        state.dropped += 1;
                        self.not_empty.notify_one();
                        if let Some(old) = &evicted {
                            tracing::warn!(
                                event_id = %old.id,
                                "Event queue full, dropped oldest event"
                            );
                        }
                        return Ok(evicted);
                    }
                    OverflowPolicy::Block => {}
                }
            }

            notified.await;
        }
    }

    /// Next event in FIFO order; `None` once closed and drained
    pub async fn pop(&self) -> Option<Event> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(event) = state.items.pop_front() {
                    self.not_full.notify_one();
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Reject further pushes; queued events remain poppable
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.items.is_empty()
    }

    /// Events evicted under `DropOldest` so far
    pub async fn dropped(&self) -> u64 {
        self.state.lock().await.dropped
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}
