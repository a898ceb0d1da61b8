//! Bounded, priority-ordered queue state.
//!
//! `QueueState` is the in-memory index of queue items: a primary map by id,
//! a total dispatch order `(priority_rank, created_at, id)`, and a
//! per-resource index for batch planning. It is purely synchronous; the
//! client layer wraps it with locking and persistence.
//!
//! # Capacity
//!
//! The queue is bounded by `max_size`. When full, an incoming item that
//! outranks `Low` may evict a single pending low-priority item (the youngest
//! one, which has waited the least); otherwise insertion fails.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::types::{ItemStatus, Priority, QueueItem, Resource};

/// Insertion failed because the queue is at capacity and no pending
/// low-priority item could be evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue is full and no low-priority item can be evicted")
    }
}

impl std::error::Error for QueueFull {}

/// Result of a successful insertion.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// The item was stored without displacing anything.
    Accepted,
    /// The item was stored after evicting the contained pending low-priority item.
    Evicted(QueueItem),
}

/// A status change was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    UnknownItem { id: String },
    InvalidTransition { from: ItemStatus, to: ItemStatus },
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionError::UnknownItem { id } => write!(f, "unknown queue item: {id}"),
            TransitionError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from:?} -> {to:?}")
            }
        }
    }
}

impl std::error::Error for TransitionError {}

/// In-memory queue index. See the module docs for the ordering contract.
pub struct QueueState {
    items: HashMap<String, QueueItem>,
    /// Total dispatch order: `(priority_rank, created_at, id)`.
    order: BTreeSet<(u8, i64, String)>,
    by_resource: HashMap<Resource, BTreeSet<String>>,
    max_size: usize,
}

impl QueueState {
    /// Creates an empty queue bounded at `max_size` items.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            items: HashMap::new(),
            order: BTreeSet::new(),
            by_resource: HashMap::new(),
            max_size,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&QueueItem> {
        self.items.get(id)
    }

    /// Inserts an item, evicting a pending low-priority item when at capacity
    /// and the incoming item outranks `Low`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueFull`] when the queue is at capacity and no eviction is
    /// possible.
    pub fn insert(&mut self, item: QueueItem) -> Result<EnqueueOutcome, QueueFull> {
        debug_assert!(!self.items.contains_key(&item.id), "duplicate queue item id");

        let mut evicted = None;
        if self.items.len() >= self.max_size {
            if item.priority >= Priority::Low {
                return Err(QueueFull);
            }
            let victim_id = self.eviction_candidate().ok_or(QueueFull)?;
            evicted = self.remove(&victim_id);
        }

        self.order.insert(item.order_key());
        self.by_resource
            .entry(item.resource)
            .or_default()
            .insert(item.id.clone());
        self.items.insert(item.id.clone(), item);

        Ok(match evicted {
            Some(victim) => EnqueueOutcome::Evicted(victim),
            None => EnqueueOutcome::Accepted,
        })
    }

    /// The youngest pending low-priority item, if any.
    fn eviction_candidate(&self) -> Option<String> {
        self.order
            .iter()
            .rev()
            .take_while(|(rank, _, _)| *rank == Priority::Low.rank())
            .find(|(_, _, id)| {
                self.items.get(id).is_some_and(|i| i.status == ItemStatus::Pending)
            })
            .map(|(_, _, id)| id.clone())
    }

    /// Removes and returns an item.
    pub fn remove(&mut self, id: &str) -> Option<QueueItem> {
        let item = self.items.remove(id)?;
        self.order.remove(&item.order_key());
        if let Some(ids) = self.by_resource.get_mut(&item.resource) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_resource.remove(&item.resource);
            }
        }
        Some(item)
    }

    /// Applies `patch` to an item and re-indexes it. The id must not change.
    ///
    /// Returns `false` when the id is unknown.
    pub fn update(&mut self, id: &str, patch: impl FnOnce(&mut QueueItem)) -> bool {
        let Some(item) = self.items.get_mut(id) else {
            return false;
        };
        let old_key = item.order_key();
        let old_resource = item.resource;

        patch(item);
        debug_assert_eq!(item.id, id, "queue item id is immutable");

        let new_key = item.order_key();
        let new_resource = item.resource;
        if new_key != old_key {
            self.order.remove(&old_key);
            self.order.insert(new_key);
        }
        if new_resource != old_resource {
            let id_owned = id.to_string();
            if let Some(ids) = self.by_resource.get_mut(&old_resource) {
                ids.remove(id);
            }
            self.by_resource.entry(new_resource).or_default().insert(id_owned);
        }
        true
    }

    /// Moves an item to `to`, validating the status machine and bumping
    /// `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] for unknown ids or invalid edges.
    pub fn transition(&mut self, id: &str, to: ItemStatus, now: i64) -> Result<(), TransitionError> {
        let from = self
            .items
            .get(id)
            .map(|i| i.status)
            .ok_or_else(|| TransitionError::UnknownItem { id: id.to_string() })?;
        if !from.can_transition(to) {
            return Err(TransitionError::InvalidTransition { from, to });
        }
        self.update(id, |item| {
            item.status = to;
            item.updated_at = now;
            if to == ItemStatus::Pending {
                // Re-entering pending consumes the schedule unless it is
                // still in the future.
                if item.scheduled_at.is_some_and(|at| at <= now) {
                    item.scheduled_at = None;
                }
            }
        });
        Ok(())
    }

    /// Pending items ready for dispatch at `now`, in dispatch order, up to
    /// `limit`. An item is ready when its schedule has elapsed and every
    /// dependency is completed (a missing dependency counts as completed,
    /// since completed items may have been pruned).
    #[must_use]
    pub fn ready_items(&self, now: i64, limit: usize) -> Vec<&QueueItem> {
        let mut ready = Vec::new();
        for (_, _, id) in &self.order {
            if ready.len() >= limit {
                break;
            }
            let Some(item) = self.items.get(id) else { continue };
            if item.is_ready_at(now) && self.dependencies_satisfied(item) {
                ready.push(item);
            }
        }
        ready
    }

    fn dependencies_satisfied(&self, item: &QueueItem) -> bool {
        item.depends_on.iter().all(|dep| {
            self.items
                .get(dep)
                .is_none_or(|d| d.status == ItemStatus::Completed)
        })
    }

    /// All items targeting `resource`, in dispatch order.
    #[must_use]
    pub fn by_resource(&self, resource: Resource) -> Vec<&QueueItem> {
        let Some(ids) = self.by_resource.get(&resource) else {
            return Vec::new();
        };
        let mut items: Vec<&QueueItem> =
            ids.iter().filter_map(|id| self.items.get(id)).collect();
        items.sort_by_key(|i| (i.priority.rank(), i.created_at));
        items
    }

    /// Every item, unordered.
    pub fn iter(&self) -> impl Iterator<Item = &QueueItem> {
        self.items.values()
    }

    #[must_use]
    pub fn counts_by_status(&self) -> BTreeMap<ItemStatus, usize> {
        let mut counts = BTreeMap::new();
        for item in self.items.values() {
            *counts.entry(item.status).or_insert(0) += 1;
        }
        counts
    }

    #[must_use]
    pub fn counts_by_priority(&self) -> BTreeMap<Priority, usize> {
        let mut counts = BTreeMap::new();
        for item in self.items.values() {
            *counts.entry(item.priority).or_insert(0) += 1;
        }
        counts
    }

    /// Removes completed items older than `before`, returning their ids.
    pub fn prune_completed(&mut self, before: i64) -> Vec<String> {
        let stale: Vec<String> = self
            .items
            .values()
            .filter(|i| i.status == ItemStatus::Completed && i.updated_at < before)
            .map(|i| i.id.clone())
            .collect();
        for id in &stale {
            self.remove(id);
        }
        stale
    }
}
