//! Batch planning: grouping ready items into dispatchable batches.
//!
//! The planner is pure: it takes ready items plus the currently open batches
//! and returns new batches, filling open ones first. Grouping is by any
//! combination of resource, priority, and time window; the group key is the
//! string `resource|priority|window` with `*` for dimensions not grouped on.

use serde::{Deserialize, Serialize};

use crate::types::{Batch, BatchMode, BatchStatus, Priority, QueueItem};

/// Planner configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerConfig {
    pub group_by_resource: bool,
    pub group_by_priority: bool,
    pub group_by_time_window: bool,
    /// Width of the grouping window in milliseconds.
    pub window_size_ms: i64,
    pub max_items_per_batch: usize,
    /// When false and priority grouping is off, mixed-priority batches are
    /// still ordered by priority internally (inherited from queue order).
    pub priority_mixing: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            group_by_resource: true,
            group_by_priority: false,
            group_by_time_window: false,
            window_size_ms: 5_000,
            max_items_per_batch: 25,
            priority_mixing: true,
        }
    }
}

/// Groups ready items into batches.
#[derive(Debug, Clone, Default)]
pub struct BatchPlanner {
    config: PlannerConfig,
}

impl BatchPlanner {
    #[must_use]
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Grouping key for an item at plan time.
    #[must_use]
    pub fn group_key(&self, item: &QueueItem, now: i64) -> String {
        let resource = if self.config.group_by_resource {
            item.resource.as_str()
        } else {
            "*"
        };
        let priority = if self.config.group_by_priority || !self.config.priority_mixing {
            item.priority.rank().to_string()
        } else {
            "*".to_string()
        };
        let window = if self.config.group_by_time_window && self.config.window_size_ms > 0 {
            (now / self.config.window_size_ms).to_string()
        } else {
            "*".to_string()
        };
        format!("{resource}|{priority}|{window}")
    }

    /// Plans batches for `items`, absorbing into `open` batches (same group
    /// key, still pending, not full) before creating new ones.
    ///
    /// `next_id` supplies fresh batch ids so the planner itself stays pure.
    pub fn plan(
        &self,
        items: &[&QueueItem],
        open: &mut Vec<Batch>,
        now: i64,
        mut next_id: impl FnMut() -> String,
    ) -> Vec<Batch> {
        let mut created: Vec<Batch> = Vec::new();

        for item in items {
            let key = self.group_key(item, now);

            let slot = open
                .iter_mut()
                .chain(created.iter_mut())
                .find(|b| {
                    b.group_key == key
                        && b.status == BatchStatus::Pending
                        && b.item_ids.len() < self.config.max_items_per_batch
                        && !b.item_ids.contains(&item.id)
                });

            match slot {
                Some(batch) => batch.item_ids.push(item.id.clone()),
                None => created.push(Batch {
                    id: next_id(),
                    item_ids: vec![item.id.clone()],
                    mode: BatchMode::Sequential,
                    status: BatchStatus::Pending,
                    created_at: now,
                    group_key: key,
                }),
            }
        }

        // Decide the processing mode once membership is final.
        for batch in &mut created {
            batch.mode = choose_mode(batch, items);
        }
        for batch in open.iter_mut() {
            batch.mode = choose_mode(batch, items);
        }

        created
    }
}

/// Processing-mode selection:
/// sequential when any member has dependencies; parallel (bounded) when all
/// members are independent, at least one is high or critical, and the batch
/// holds at most ten items; sequential otherwise.
fn choose_mode(batch: &Batch, items: &[&QueueItem]) -> BatchMode {
    let members: Vec<&&QueueItem> =
        items.iter().filter(|i| batch.item_ids.contains(&i.id)).collect();
    if members.is_empty() {
        return batch.mode;
    }

    let any_dependencies = members.iter().any(|i| !i.depends_on.is_empty());
    if any_dependencies {
        return BatchMode::Sequential;
    }

    let any_urgent = members
        .iter()
        .any(|i| matches!(i.priority, Priority::Critical | Priority::High));
    if any_urgent && batch.item_ids.len() <= 10 {
        return BatchMode::Parallel { max_concurrency: 4 };
    }

    BatchMode::Sequential
}
