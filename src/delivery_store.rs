//! Delivery record storage
//!
//! Deliveries are kept in memory and persisted one record at a time to
//! the `deliveries` collection, so a write costs the same no matter how
//! much history is retained. State I/O runs on the blocking pool and never
//! under the map lock. Mutations of one delivery are serialized by a
//! striped writer lock: `update` is a read-modify-write that concurrent
//! attempts and timers never interleave.

use crate::error::{Result, WebhookError};
use crate::state::{blocking, MemoryStateStore, StateStore};
use crate::types::{Delivery, DeliveryQuery, DeliveryStatus, Page};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

const DELIVERIES: &str = "deliveries";
const WRITER_STRIPES: usize = 64;

/// Aggregate delivery statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    pub total: usize,
    pub pending: usize,
    pub success: usize,
    pub failed: usize,
    pub retrying: usize,

    /// Percentage of all deliveries that succeeded (0.0 when empty)
    pub success_rate: f64,

    /// Mean `durationMs` over deliveries that made at least one attempt
    pub average_response_ms: f64,
}

/// Store of delivery records backed by a `StateStore`
pub struct DeliveryStore {
    deliveries: RwLock<HashMap<String, Delivery>>,
    writers: Vec<Mutex<()>>,
    state: Arc<dyn StateStore>,
    /// Unfinished deliveries found at load time, handed out once
    recovered: std::sync::Mutex<Vec<Delivery>>,
}

impl DeliveryStore {
    pub fn new(state: Arc<dyn StateStore>) -> Result<Self> {
        let mut deliveries = HashMap::new();
        for record in state.load_records(DELIVERIES)? {
            let delivery: Delivery = serde_json::from_value(record).map_err(|e| {
                WebhookError::Persistence(format!("Failed to decode delivery record: {}", e))
            })?;
            deliveries.insert(delivery.id.clone(), delivery);
        }
        tracing::debug!(deliveries = deliveries.len(), "Delivery store loaded");
        Ok(Self::with_records(deliveries, state))
    }

    pub fn in_memory() -> Self {
        Self::with_records(HashMap::new(), Arc::new(MemoryStateStore::new()))
    }

    fn with_records(deliveries: HashMap<String, Delivery>, state: Arc<dyn StateStore>) -> Self {
        let recovered = deliveries
            .values()
            .filter(|d| matches!(d.status, DeliveryStatus::Pending | DeliveryStatus::Retrying))
            .cloned()
            .collect();
        Self {
            deliveries: RwLock::new(deliveries),
            writers: (0..WRITER_STRIPES).map(|_| Mutex::new(())).collect(),
            state,
            recovered: std::sync::Mutex::new(recovered),
        }
    }

    /// Pending and retrying deliveries loaded from state; empty after the first call
    pub fn take_recovered(&self) -> Vec<Delivery> {
        let mut recovered = self
            .recovered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *recovered)
    }

    fn writer(&self, id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.writers[hasher.finish() as usize % self.writers.len()]
    }

    async fn persist(&self, delivery: &Delivery) -> Result<()> {
        let record = serde_json::to_value(delivery)?;
        let id = delivery.id.clone();
        let state = self.state.clone();
        blocking(move || state.put_record(DELIVERIES, &id, &record))
            .await
            .inspect_err(|e| {
                tracing::error!(
                    delivery_id = %delivery.id,
                    error = %e,
                    "Failed to persist delivery"
                );
            })
    }

    async fn unpersist(&self, id: &str) -> Result<()> {
        let owned = id.to_string();
        let state = self.state.clone();
        blocking(move || state.remove_record(DELIVERIES, &owned))
            .await
            .inspect_err(|e| {
                tracing::error!(delivery_id = %id, error = %e, "Failed to remove delivery record");
            })
    }

    pub async fn insert(&self, delivery: Delivery) -> Result<Delivery> {
        let _writer = self.writer(&delivery.id).lock().await;
        self.persist(&delivery).await?;
        self.deliveries
            .write()
            .await
            .insert(delivery.id.clone(), delivery.clone());
        Ok(delivery)
    }

    /// Atomically modify a delivery and persist the result
    pub async fn update<F>(&self, id: &str, f: F) -> Result<Delivery>
    where
        F: FnOnce(&mut Delivery),
    {
        let _writer = self.writer(id).lock().await;
        let mut updated = self
            .get(id)
            .await
            .ok_or_else(|| WebhookError::not_found("Delivery", id))?;
        f(&mut updated);

        self.persist(&updated).await?;
        self.deliveries
            .write()
            .await
            .insert(id.to_string(), updated.clone());
        Ok(updated)
    }

    pub async fn get(&self, id: &str) -> Option<Delivery> {
        self.deliveries.read().await.get(id).cloned()
    }

    pub async fn delete(&self, id: &str) -> Result<Delivery> {
        let _writer = self.writer(id).lock().await;
        if !self.deliveries.read().await.contains_key(id) {
            return Err(WebhookError::not_found("Delivery", id));
        }

        self.unpersist(id).await?;
        self.deliveries
            .write()
            .await
            .remove(id)
            .ok_or_else(|| WebhookError::not_found("Delivery", id))
    }

    /// Filtered, paginated listing ordered newest first
    pub async fn query(&self, query: &DeliveryQuery) -> Page<Delivery> {
        let map = self.deliveries.read().await;
        let mut matched: Vec<&Delivery> = map
            .values()
            .filter(|d| {
                query
                    .subscription_id
                    .as_ref()
                    .map_or(true, |s| &d.subscription_id == s)
            })
            .filter(|d| query.status.map_or(true, |s| d.status == s))
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        let total = matched.len();
        let items = matched
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect();

        Page {
            items,
            total,
            limit: query.limit,
            offset: query.offset,
        }
    }

    /// Ids of every delivery belonging to a subscription
    pub async fn ids_for_subscription(&self, subscription_id: &str) -> Vec<String> {
        self.deliveries
            .read()
            .await
            .values()
            .filter(|d| d.subscription_id == subscription_id)
            .map(|d| d.id.clone())
            .collect()
    }

    /// Remove deliveries created before `cutoff`, returning the ids removed
    ///
    /// Records that fail to delete stay in the store and are retried by
    /// the next purge; an error is returned only when none could be removed.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let expired: Vec<String> = self
            .deliveries
            .read()
            .await
            .values()
            .filter(|d| d.created_at < cutoff)
            .map(|d| d.id.clone())
            .collect();

        let mut purged = Vec::with_capacity(expired.len());
        let mut last_error = None;
        for id in expired {
            let _writer = self.writer(&id).lock().await;
            if let Err(e) = self.unpersist(&id).await {
                last_error = Some(e);
                continue;
            }
            if self.deliveries.write().await.remove(&id).is_some() {
                purged.push(id);
            }
        }

        match last_error {
            Some(e) if purged.is_empty() => Err(e),
            _ => Ok(purged),
        }
    }

    pub async fn len(&self) -> usize {
        self.deliveries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.deliveries.read().await.is_empty()
    }

    pub async fn stats(&self) -> DeliveryStats {
        let map = self.deliveries.read().await;
        let mut stats = DeliveryStats {
            total: map.len(),
            ..Default::default()
        };

        let mut duration_sum: u64 = 0;
        let mut timed: u64 = 0;
        for d in map.values() {
            match d.status {
                DeliveryStatus::Pending => stats.pending += 1,
                DeliveryStatus::Success => stats.success += 1,
                DeliveryStatus::Failed => stats.failed += 1,
                DeliveryStatus::Retrying => stats.retrying += 1,
            }
            if let Some(ms) = d.duration_ms {
                duration_sum = duration_sum.saturating_add(ms);
                timed += 1;
            }
        }

        if stats.total > 0 {
            stats.success_rate = stats.success as f64 / stats.total as f64 * 100.0;
        }
        if timed > 0 {
            stats.average_response_ms = duration_sum as f64 / timed as f64;
        }
        stats
    }
}
