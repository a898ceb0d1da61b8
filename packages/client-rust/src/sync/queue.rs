//! Persistent priority queue.
//!
//! Wraps the in-memory [`QueueState`] with locking, id generation, event
//! emission, and write-through persistence under the `queue` namespace.
//! Every mutation lands in storage (when `persist_queue` is on) so a crashed
//! process can recover; on startup, items stuck in `processing` are demoted
//! back to `pending`.

use std::collections::BTreeMap;
use std::sync::Arc;

use acube_core::clock::ClockSource;
use acube_core::conflict::ConflictStrategy;
use acube_core::queue::{EnqueueOutcome, QueueState};
use acube_core::types::{
    ItemStatus, OperationKind, Priority, QueueItem, Resource,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SdkError;
use crate::events::{EventBus, SdkEvent};
use crate::storage::entry::{QueryOptions, SetOptions};
use crate::storage::UnifiedStorage;

/// Storage key prefix for queue items.
const ITEM_PREFIX: &str = "queue:item:";

/// Caller-facing enqueue request; the queue assigns id, status, timestamps.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub operation: OperationKind,
    pub resource: Resource,
    pub payload: Value,
    pub priority: Priority,
    pub scheduled_at: Option<i64>,
    pub max_retries: Option<u32>,
    pub depends_on: std::collections::BTreeSet<String>,
    pub conflict_override: Option<ConflictStrategy>,
    pub optimistic_id: Option<String>,
    pub metadata: Value,
}

impl NewItem {
    #[must_use]
    pub fn new(
        operation: OperationKind,
        resource: Resource,
        payload: Value,
        priority: Priority,
    ) -> Self {
        Self {
            operation,
            resource,
            payload,
            priority,
            scheduled_at: None,
            max_retries: None,
            depends_on: std::collections::BTreeSet::new(),
            conflict_override: None,
            optimistic_id: None,
            metadata: Value::Null,
        }
    }
}

/// Partial update for [`PersistentQueue::update`].
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    pub payload: Option<Value>,
    pub priority: Option<Priority>,
    pub scheduled_at: Option<Option<i64>>,
    pub max_retries: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub metadata: Option<Value>,
}

/// Counts reported by [`PersistentQueue::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatsSnapshot {
    pub total: usize,
    pub max_size: usize,
    pub by_status: BTreeMap<ItemStatus, usize>,
    pub by_priority: BTreeMap<Priority, usize>,
}

/// Priority queue with write-through persistence.
pub struct PersistentQueue {
    state: RwLock<QueueState>,
    storage: Arc<UnifiedStorage>,
    persist: bool,
    default_max_retries: u32,
    clock: Arc<dyn ClockSource>,
    events: EventBus,
}

impl PersistentQueue {
    #[must_use]
    pub fn new(
        storage: Arc<UnifiedStorage>,
        max_size: usize,
        default_max_retries: u32,
        persist: bool,
        clock: Arc<dyn ClockSource>,
        events: EventBus,
    ) -> Self {
        Self {
            state: RwLock::new(QueueState::new(max_size)),
            storage,
            persist,
            default_max_retries,
            clock,
            events,
        }
    }

    fn item_key(id: &str) -> String {
        format!("{ITEM_PREFIX}{id}")
    }

    async fn persist_item(&self, item: &QueueItem) -> Result<(), SdkError> {
        if self.persist {
            self.storage
                .set(&Self::item_key(&item.id), item, SetOptions::default())
                .await?;
        }
        Ok(())
    }

    async fn persist_by_id(&self, id: &str) -> Result<(), SdkError> {
        let item = self.state.read().get(id).cloned();
        match item {
            Some(item) => self.persist_item(&item).await,
            None => Ok(()),
        }
    }

    async fn unpersist(&self, id: &str) -> Result<(), SdkError> {
        if self.persist {
            self.storage.delete(&Self::item_key(id)).await?;
        }
        Ok(())
    }

    /// Reloads persisted items and demotes crashed `processing` items back to
    /// `pending`.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] on backend failures.
    pub async fn init(&self) -> Result<usize, SdkError> {
        if !self.persist {
            return Ok(0);
        }

        let entries = self
            .storage
            .query(&QueryOptions {
                prefix: Some(ITEM_PREFIX.to_string()),
                ..QueryOptions::default()
            })
            .await?;

        let mut demoted = Vec::new();
        let mut loaded = 0;
        {
            let mut state = self.state.write();
            for entry in entries {
                match serde_json::from_value::<QueueItem>(entry.data) {
                    Ok(mut item) => {
                        // The owning process may have crashed mid-dispatch.
                        if item.status == ItemStatus::Processing {
                            item.status = ItemStatus::Pending;
                            demoted.push(item.id.clone());
                        }
                        if state.insert(item).is_ok() {
                            loaded += 1;
                        }
                    }
                    Err(err) => {
                        warn!(key = %entry.metadata.key, %err, "dropping unreadable queue item");
                    }
                }
            }
        }
        for id in &demoted {
            self.persist_by_id(id).await?;
        }

        if loaded > 0 {
            info!(loaded, demoted = demoted.len(), "queue restored from storage");
        }
        Ok(loaded)
    }

    /// Adds an item, possibly evicting a pending low-priority one.
    ///
    /// # Errors
    ///
    /// - [`SdkError::QueueFull`] at capacity with nothing evictable.
    /// - [`SdkError::Storage`] when persistence fails.
    pub async fn enqueue(&self, new: NewItem) -> Result<QueueItem, SdkError> {
        let now = self.clock.now_ms();
        let starts_scheduled = new.scheduled_at.is_some_and(|at| at > now);
        let item = QueueItem {
            id: Uuid::new_v4().to_string(),
            operation: new.operation,
            resource: new.resource,
            payload: new.payload,
            priority: new.priority,
            status: if starts_scheduled { ItemStatus::Scheduled } else { ItemStatus::Pending },
            created_at: now,
            updated_at: now,
            scheduled_at: new.scheduled_at,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(self.default_max_retries),
            last_error: None,
            optimistic_id: new.optimistic_id,
            depends_on: new.depends_on,
            conflict_override: new.conflict_override,
            metadata: new.metadata,
        };

        let outcome = self
            .state
            .write()
            .insert(item.clone())
            .map_err(|_| SdkError::QueueFull)?;

        if let EnqueueOutcome::Evicted(victim) = outcome {
            warn!(id = %victim.id, "evicted low-priority item for higher-priority arrival");
            self.unpersist(&victim.id).await?;
            self.events.emit(SdkEvent::QueueEvicted { id: victim.id });
        }

        self.persist_item(&item).await?;
        self.events.emit(SdkEvent::QueueEnqueued {
            id: item.id.clone(),
            resource: item.resource,
        });
        metrics::counter!("queue_items_enqueued_total").increment(1);
        Ok(item)
    }

    /// Removes and returns an item.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] when unpersisting fails.
    pub async fn dequeue(&self, id: &str) -> Result<Option<QueueItem>, SdkError> {
        let removed = self.state.write().remove(id);
        if removed.is_some() {
            self.unpersist(id).await?;
        }
        Ok(removed)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<QueueItem> {
        self.state.read().get(id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.state.read().max_size()
    }

    /// Ready items in dispatch order (see [`QueueState::ready_items`]).
    #[must_use]
    pub fn peek_ready(&self, limit: usize) -> Vec<QueueItem> {
        let now = self.clock.now_ms();
        self.state
            .read()
            .ready_items(now, limit)
            .into_iter()
            .cloned()
            .collect()
    }

    /// All items for one resource, in dispatch order.
    #[must_use]
    pub fn by_resource(&self, resource: Resource) -> Vec<QueueItem> {
        self.state.read().by_resource(resource).into_iter().cloned().collect()
    }

    /// Applies a partial patch and bumps `updated_at`.
    ///
    /// # Errors
    ///
    /// - [`SdkError::NotFound`] for unknown ids.
    /// - [`SdkError::Storage`] when persistence fails.
    pub async fn update(&self, id: &str, patch: ItemPatch) -> Result<QueueItem, SdkError> {
        let now = self.clock.now_ms();
        let updated = {
            let mut state = self.state.write();
            if !state.update(id, |item| {
                if let Some(payload) = patch.payload {
                    item.payload = payload;
                }
                if let Some(priority) = patch.priority {
                    item.priority = priority;
                }
                if let Some(scheduled_at) = patch.scheduled_at {
                    item.scheduled_at = scheduled_at;
                }
                if let Some(max_retries) = patch.max_retries {
                    item.max_retries = max_retries;
                }
                if let Some(last_error) = patch.last_error {
                    item.last_error = last_error;
                }
                if let Some(metadata) = patch.metadata {
                    item.metadata = metadata;
                }
                item.updated_at = now;
            }) {
                return Err(SdkError::NotFound { what: format!("queue item {id}") });
            }
            state.get(id).cloned()
        };

        let item = updated.ok_or_else(|| SdkError::NotFound { what: format!("queue item {id}") })?;
        self.persist_item(&item).await?;
        Ok(item)
    }

    /// Validated status transition plus persistence.
    ///
    /// # Errors
    ///
    /// - [`SdkError::Validation`] for an edge outside the status machine.
    /// - [`SdkError::Storage`] when persistence fails.
    pub async fn transition(&self, id: &str, to: ItemStatus) -> Result<(), SdkError> {
        let now = self.clock.now_ms();
        self.state
            .write()
            .transition(id, to, now)
            .map_err(|err| SdkError::Validation { message: err.to_string() })?;
        self.persist_by_id(id).await
    }

    /// Failure bookkeeping: `processing -> failed` with the error recorded.
    ///
    /// # Errors
    ///
    /// See [`PersistentQueue::transition`].
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<(), SdkError> {
        let now = self.clock.now_ms();
        self.state
            .write()
            .transition(id, ItemStatus::Failed, now)
            .map_err(|err| SdkError::Validation { message: err.to_string() })?;
        self.state.write().update(id, |item| {
            item.last_error = Some(error.to_string());
        });
        self.persist_by_id(id).await
    }

    /// Retry bookkeeping: `failed -> pending`, schedule set, budget spent.
    ///
    /// # Errors
    ///
    /// See [`PersistentQueue::transition`].
    pub async fn retry_later(&self, id: &str, at: i64, consume_budget: bool) -> Result<(), SdkError> {
        let now = self.clock.now_ms();
        self.state
            .write()
            .transition(id, ItemStatus::Pending, now)
            .map_err(|err| SdkError::Validation { message: err.to_string() })?;
        self.state.write().update(id, |item| {
            item.scheduled_at = Some(at);
            if consume_budget {
                item.retry_count += 1;
            }
        });
        self.persist_by_id(id).await
    }

    /// Terminal failure: the item will never dispatch again.
    ///
    /// # Errors
    ///
    /// See [`PersistentQueue::transition`].
    pub async fn mark_dead(&self, id: &str, reason: &str) -> Result<(), SdkError> {
        let now = self.clock.now_ms();
        self.state
            .write()
            .transition(id, ItemStatus::Dead, now)
            .map_err(|err| SdkError::Validation { message: err.to_string() })?;
        self.state.write().update(id, |item| {
            item.last_error = Some(reason.to_string());
        });
        self.persist_by_id(id).await?;
        self.events
            .emit(SdkEvent::QueueDead { id: id.to_string(), reason: reason.to_string() });
        metrics::counter!("queue_items_dead_total").increment(1);
        Ok(())
    }

    /// Promotes `scheduled` items whose time arrived back to `pending`.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] when persistence fails.
    pub async fn promote_scheduled(&self) -> Result<(), SdkError> {
        let now = self.clock.now_ms();
        let due: Vec<String> = self
            .state
            .read()
            .iter()
            .filter(|i| {
                i.status == ItemStatus::Scheduled && i.scheduled_at.is_some_and(|at| at <= now)
            })
            .map(|i| i.id.clone())
            .collect();

        for id in due {
            self.transition(&id, ItemStatus::Pending).await?;
        }
        Ok(())
    }

    /// Drops completed items older than `before`.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] when unpersisting fails.
    pub async fn prune_completed(&self, before: i64) -> Result<usize, SdkError> {
        let pruned = self.state.write().prune_completed(before);
        for id in &pruned {
            self.unpersist(id).await?;
        }
        Ok(pruned.len())
    }

    #[must_use]
    pub fn stats(&self) -> QueueStatsSnapshot {
        let state = self.state.read();
        QueueStatsSnapshot {
            total: state.len(),
            max_size: state.max_size(),
            by_status: state.counts_by_status(),
            by_priority: state.counts_by_priority(),
        }
    }
}

#[cfg(test)]
mod tests {
    use acube_core::clock::ManualClock;
    use serde_json::json;

    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::backends::memory::MemoryBackend;

    struct Fixture {
        queue: PersistentQueue,
        storage: Arc<UnifiedStorage>,
        clock: Arc<ManualClock>,
    }

    fn storage(clock: Arc<ManualClock>) -> Arc<UnifiedStorage> {
        UnifiedStorage::new(
            Arc::new(MemoryBackend::new()),
            None,
            clock,
            EventBus::new(),
            StorageConfig::default(),
            64,
            0,
        )
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let storage = storage(clock.clone());
        let queue = PersistentQueue::new(
            storage.clone(),
            10,
            3,
            true,
            clock.clone(),
            EventBus::new(),
        );
        Fixture { queue, storage, clock }
    }

    fn new_item(priority: Priority) -> NewItem {
        NewItem::new(
            OperationKind::Create,
            Resource::Receipt,
            json!({"amount": 10}),
            priority,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_assigns_id_and_persists() {
        let f = fixture();
        let item = f.queue.enqueue(new_item(Priority::Normal)).await.unwrap();
        assert!(!item.id.is_empty());
        assert_eq!(item.status, ItemStatus::Pending);

        let stored: Option<QueueItem> =
            f.storage.get(&format!("queue:item:{}", item.id)).await.unwrap();
        assert_eq!(stored.unwrap().id, item.id);
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_removes_item_and_persistence() {
        let f = fixture();
        let item = f.queue.enqueue(new_item(Priority::Normal)).await.unwrap();

        let removed = f.queue.dequeue(&item.id).await.unwrap().unwrap();
        assert_eq!(removed.id, item.id);
        assert!(f.queue.get(&item.id).is_none());

        let stored: Option<QueueItem> =
            f.storage.get(&format!("queue:item:{}", item.id)).await.unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn future_schedule_starts_as_scheduled_and_promotes() {
        let f = fixture();
        let mut request = new_item(Priority::Normal);
        request.scheduled_at = Some(5_000);
        let item = f.queue.enqueue(request).await.unwrap();
        assert_eq!(item.status, ItemStatus::Scheduled);
        assert!(f.queue.peek_ready(10).is_empty());

        f.clock.set(5_000);
        f.queue.promote_scheduled().await.unwrap();
        let ready = f.queue.peek_ready(10);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, item.id);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_retry_and_death_flow() {
        let f = fixture();
        let item = f.queue.enqueue(new_item(Priority::High)).await.unwrap();

        f.queue.transition(&item.id, ItemStatus::Processing).await.unwrap();
        f.queue.mark_failed(&item.id, "SERVER_ERROR").await.unwrap();
        assert_eq!(f.queue.get(&item.id).unwrap().status, ItemStatus::Failed);
        assert_eq!(
            f.queue.get(&item.id).unwrap().last_error.as_deref(),
            Some("SERVER_ERROR")
        );

        f.queue.retry_later(&item.id, 10_000, true).await.unwrap();
        let retried = f.queue.get(&item.id).unwrap();
        assert_eq!(retried.status, ItemStatus::Pending);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.scheduled_at, Some(10_000));
        assert!(f.queue.peek_ready(10).is_empty(), "not ready before its schedule");

        f.clock.set(10_000);
        assert_eq!(f.queue.peek_ready(10).len(), 1);

        f.queue.transition(&item.id, ItemStatus::Processing).await.unwrap();
        f.queue.mark_failed(&item.id, "SERVER_ERROR").await.unwrap();
        f.queue.mark_dead(&item.id, "max_retries_exceeded").await.unwrap();
        let dead = f.queue.get(&item.id).unwrap();
        assert_eq!(dead.status, ItemStatus::Dead);
    }

    #[tokio::test(start_paused = true)]
    async fn double_complete_is_rejected() {
        let f = fixture();
        let item = f.queue.enqueue(new_item(Priority::Normal)).await.unwrap();
        f.queue.transition(&item.id, ItemStatus::Processing).await.unwrap();
        f.queue.transition(&item.id, ItemStatus::Completed).await.unwrap();

        let err = f
            .queue
            .transition(&item.id, ItemStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Validation { .. }));
        assert_eq!(f.queue.get(&item.id).unwrap().status, ItemStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_recovers_items_and_demotes_processing() {
        let clock = Arc::new(ManualClock::new(1_000));
        let storage = storage(clock.clone());
        {
            let queue = PersistentQueue::new(
                storage.clone(),
                10,
                3,
                true,
                clock.clone(),
                EventBus::new(),
            );
            let a = queue.enqueue(new_item(Priority::Normal)).await.unwrap();
            queue.enqueue(new_item(Priority::Low)).await.unwrap();
            queue.transition(&a.id, ItemStatus::Processing).await.unwrap();
        }

        // A fresh queue over the same storage sees both items; the one that
        // was mid-flight is pending again.
        let queue = PersistentQueue::new(storage, 10, 3, true, clock, EventBus::new());
        let loaded = queue.init().await.unwrap();
        assert_eq!(loaded, 2);
        let stats = queue.stats();
        assert_eq!(stats.by_status.get(&ItemStatus::Pending), Some(&2));
        assert_eq!(stats.by_status.get(&ItemStatus::Processing), None);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_full_surfaces_and_eviction_emits() {
        let clock = Arc::new(ManualClock::new(1_000));
        let storage = storage(clock.clone());
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let queue =
            PersistentQueue::new(storage, 2, 3, true, clock, events);

        queue.enqueue(new_item(Priority::Normal)).await.unwrap();
        queue.enqueue(new_item(Priority::Low)).await.unwrap();

        // Full of normal+low: a critical arrival evicts the low one.
        queue.enqueue(new_item(Priority::Critical)).await.unwrap();
        assert_eq!(queue.len(), 2);

        // Full of normal/critical: low arrival fails outright.
        let err = queue.enqueue(new_item(Priority::Low)).await.unwrap_err();
        assert!(matches!(err, SdkError::QueueFull));

        let mut evicted = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SdkEvent::QueueEvicted { .. }) {
                evicted += 1;
            }
        }
        assert_eq!(evicted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn update_patches_fields() {
        let f = fixture();
        let item = f.queue.enqueue(new_item(Priority::Low)).await.unwrap();

        f.clock.advance(500);
        let updated = f
            .queue
            .update(
                &item.id,
                ItemPatch {
                    priority: Some(Priority::Critical),
                    payload: Some(json!({"amount": 99})),
                    ..ItemPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.priority, Priority::Critical);
        assert_eq!(updated.payload, json!({"amount": 99}));
        assert_eq!(updated.updated_at, 1_500);

        let err = f.queue.update("missing", ItemPatch::default()).await.unwrap_err();
        assert!(matches!(err, SdkError::NotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn prune_completed_unpersists() {
        let f = fixture();
        let item = f.queue.enqueue(new_item(Priority::Normal)).await.unwrap();
        f.queue.transition(&item.id, ItemStatus::Processing).await.unwrap();
        f.clock.advance(10);
        f.queue.transition(&item.id, ItemStatus::Completed).await.unwrap();

        f.clock.advance(100_000);
        let pruned = f.queue.prune_completed(f.clock.now_ms()).await.unwrap();
        assert_eq!(pruned, 1);
        assert!(f.queue.get(&item.id).is_none());
        let stored: Option<QueueItem> =
            f.storage.get(&format!("queue:item:{}", item.id)).await.unwrap();
        assert!(stored.is_none());
    }
}
