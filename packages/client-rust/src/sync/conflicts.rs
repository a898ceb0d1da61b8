//! Conflict resolution runtime.
//!
//! Wraps the pure rules of `acube_core::conflict` with per-resource rule
//! registration, named custom field resolvers, a bounded resolution history
//! ring for analytics, and the manual-resolution flow: a parked conflict
//! waits on a timed channel for user input, and when the window elapses the
//! server-wins default is committed with `timed_out` set.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use acube_core::clock::ClockSource;
use acube_core::conflict::{
    classify_conflict, resolve, ConflictClass, ConflictReport, ConflictStrategy, MergeInput,
    MergeRules, Resolution,
};
use acube_core::types::{QueueItem, Resource};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::events::{EventBus, SdkEvent};

/// Bounded length of the resolution history ring.
const HISTORY_CAP: usize = 100;

/// Conflict evidence reported by a resource processor.
#[derive(Debug, Clone, Default)]
pub struct ConflictPayload {
    /// The server's current copy of the resource.
    pub server_data: Value,
    pub server_version: Option<u64>,
    pub server_updated_at: Option<i64>,
    pub error_code: Option<String>,
    pub missing_dependency: bool,
}

/// Named per-field resolver, registered at runtime.
pub type CustomResolver = Arc<dyn Fn(&str, &Value, &Value) -> Option<Value> + Send + Sync>;

/// One resolved conflict, retained in the history ring.
#[derive(Debug, Clone)]
pub struct ResolutionRecord {
    pub item_id: String,
    pub resource: Resource,
    pub class: ConflictClass,
    pub resolution: Resolution,
    pub at: i64,
}

/// Runtime conflict resolver. One per orchestrator.
pub struct ConflictResolverRuntime {
    rules: RwLock<HashMap<Resource, MergeRules>>,
    resolvers: RwLock<HashMap<String, CustomResolver>>,
    pending_manual: Mutex<HashMap<String, oneshot::Sender<ConflictStrategy>>>,
    history: Mutex<VecDeque<ResolutionRecord>>,
    default_strategy: ConflictStrategy,
    stale_threshold_ms: i64,
    manual_timeout_ms: u64,
    clock: Arc<dyn ClockSource>,
    events: EventBus,
}

impl ConflictResolverRuntime {
    #[must_use]
    pub fn new(
        default_strategy: ConflictStrategy,
        stale_threshold_ms: i64,
        manual_timeout_ms: u64,
        clock: Arc<dyn ClockSource>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            rules: RwLock::new(HashMap::new()),
            resolvers: RwLock::new(HashMap::new()),
            pending_manual: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            default_strategy,
            stale_threshold_ms,
            manual_timeout_ms,
            clock,
            events,
        })
    }

    /// Installs the merge field rules for one resource.
    pub fn set_rules(&self, resource: Resource, rules: MergeRules) {
        self.rules.write().insert(resource, rules);
    }

    /// Registers a named custom field resolver.
    pub fn register_resolver(&self, name: impl Into<String>, resolver: CustomResolver) {
        self.resolvers.write().insert(name.into(), resolver);
    }

    /// Classifies and resolves a conflict for `item`.
    ///
    /// For the manual strategy the returned resolution is the immediate
    /// server-wins default flagged `requires_user_input`; the final outcome
    /// (user choice or timed-out default) lands in the history ring and on
    /// the event bus when the window closes.
    pub fn handle(self: &Arc<Self>, item: &QueueItem, conflict: &ConflictPayload) -> Resolution {
        let now = self.clock.now_ms();
        let report = ConflictReport {
            error_code: conflict.error_code.clone(),
            local_version: None,
            server_version: conflict.server_version,
            local_updated_at: Some(item.updated_at),
            server_updated_at: conflict.server_updated_at,
            missing_dependency: conflict.missing_dependency,
        };
        let class = classify_conflict(&report, now, self.stale_threshold_ms);
        let strategy = item.conflict_override.unwrap_or(self.default_strategy);
        debug!(item_id = %item.id, ?class, ?strategy, "resolving conflict");

        if strategy == ConflictStrategy::Manual {
            return self.park_manual(item, conflict, class);
        }

        let resolution = self.apply(item, conflict, strategy);
        self.commit(item, class, resolution.clone());
        resolution
    }

    /// Runs the pure resolution for a non-manual strategy.
    fn apply(
        &self,
        item: &QueueItem,
        conflict: &ConflictPayload,
        strategy: ConflictStrategy,
    ) -> Resolution {
        let rules = self.rules.read();
        let resolvers = self.resolvers.read();
        let lookup = |name: &str, local: &Value, server: &Value| {
            resolvers.get(name).and_then(|f| f(name, local, server))
        };

        resolve(
            MergeInput {
                local: &item.payload,
                server: &conflict.server_data,
                local_updated_at: Some(item.updated_at),
                server_updated_at: conflict.server_updated_at,
            },
            strategy,
            rules.get(&item.resource),
            Some(&lookup),
        )
    }

    /// Parks a manual conflict on a timed channel and returns the interim
    /// default.
    fn park_manual(
        self: &Arc<Self>,
        item: &QueueItem,
        conflict: &ConflictPayload,
        class: ConflictClass,
    ) -> Resolution {
        let (tx, rx) = oneshot::channel();
        self.pending_manual.lock().insert(item.id.clone(), tx);

        let runtime = self.clone();
        let parked_item = item.clone();
        let parked_conflict = conflict.clone();
        let timeout = self.manual_timeout_ms;
        tokio::spawn(async move {
            let chosen = tokio::time::timeout(Duration::from_millis(timeout), rx).await;
            runtime.pending_manual.lock().remove(&parked_item.id);

            let (strategy, timed_out) = match chosen {
                Ok(Ok(strategy)) => (strategy, false),
                // Channel dropped or window elapsed: commit the default.
                _ => (ConflictStrategy::ServerWins, true),
            };
            if timed_out {
                info!(item_id = %parked_item.id, "manual resolution window elapsed, committing default");
            }

            let mut resolution = runtime.apply(&parked_item, &parked_conflict, strategy);
            resolution.timed_out = timed_out;
            runtime.commit(&parked_item, class, resolution);
        });

        let mut interim = resolve(
            MergeInput {
                local: &item.payload,
                server: &conflict.server_data,
                local_updated_at: Some(item.updated_at),
                server_updated_at: conflict.server_updated_at,
            },
            ConflictStrategy::Manual,
            None,
            None,
        );
        interim.requires_user_input = true;
        interim
    }

    /// Delivers the user's choice for a parked conflict. Returns `false`
    /// when nothing was waiting (already timed out or never parked).
    pub fn submit_manual_resolution(&self, item_id: &str, strategy: ConflictStrategy) -> bool {
        match self.pending_manual.lock().remove(item_id) {
            Some(tx) => tx.send(strategy).is_ok(),
            None => false,
        }
    }

    /// Number of conflicts still waiting for user input.
    #[must_use]
    pub fn pending_manual_count(&self) -> usize {
        self.pending_manual.lock().len()
    }

    fn commit(&self, item: &QueueItem, class: ConflictClass, resolution: Resolution) {
        self.events.emit(SdkEvent::ConflictResolved {
            item_id: item.id.clone(),
            strategy: resolution.strategy,
            confidence: resolution.confidence,
            timed_out: resolution.timed_out,
        });
        metrics::counter!("conflicts_resolved_total").increment(1);

        let mut history = self.history.lock();
        if history.len() >= HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(ResolutionRecord {
            item_id: item.id.clone(),
            resource: item.resource,
            class,
            resolution,
            at: self.clock.now_ms(),
        });
    }

    /// Snapshot of the resolution history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<ResolutionRecord> {
        self.history.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use acube_core::clock::ManualClock;
    use acube_core::conflict::{DataSource, FieldRule};
    use acube_core::types::{ItemStatus, OperationKind, Priority};
    use serde_json::json;

    use super::*;

    fn item(payload: Value, strategy: Option<ConflictStrategy>) -> QueueItem {
        QueueItem {
            id: "q-1".into(),
            operation: OperationKind::Update,
            resource: Resource::Receipt,
            payload,
            priority: Priority::Normal,
            status: ItemStatus::Processing,
            created_at: 1_000,
            updated_at: 2_000,
            scheduled_at: None,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            optimistic_id: None,
            depends_on: BTreeSet::new(),
            conflict_override: strategy,
            metadata: Value::Null,
        }
    }

    fn runtime(default: ConflictStrategy) -> (Arc<ConflictResolverRuntime>, EventBus) {
        let events = EventBus::new();
        let runtime = ConflictResolverRuntime::new(
            default,
            300_000,
            1_000,
            Arc::new(ManualClock::new(10_000)),
            events.clone(),
        );
        (runtime, events)
    }

    #[tokio::test(start_paused = true)]
    async fn merge_applies_per_resource_rules() {
        let (runtime, _) = runtime(ConflictStrategy::Merge);
        runtime.set_rules(
            Resource::Receipt,
            MergeRules::new()
                .with_rule("items", FieldRule::ArrayMerge)
                .with_rule("notes", FieldRule::Client),
        );

        let local = json!({"items": ["x", "y"], "notes": "draft"});
        let conflict = ConflictPayload {
            server_data: json!({"items": ["y", "z"], "notes": "final"}),
            server_updated_at: Some(2_100),
            ..ConflictPayload::default()
        };

        let resolution = runtime.handle(&item(local, None), &conflict);
        assert_eq!(resolution.data["items"], json!(["y", "z", "x"]));
        assert_eq!(resolution.data["notes"], "draft");
        assert_eq!(resolution.data_source, DataSource::Merged);
        assert!(resolution.confidence >= 0.7);
        assert_eq!(runtime.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn item_override_beats_the_default() {
        let (runtime, _) = runtime(ConflictStrategy::ServerWins);
        let local = json!({"v": "local"});
        let conflict =
            ConflictPayload { server_data: json!({"v": "server"}), ..ConflictPayload::default() };

        let resolution =
            runtime.handle(&item(local.clone(), Some(ConflictStrategy::ClientWins)), &conflict);
        assert_eq!(resolution.data, local);
        assert_eq!(resolution.strategy, ConflictStrategy::ClientWins);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_resolver_is_looked_up_by_name() {
        let (runtime, _) = runtime(ConflictStrategy::Merge);
        runtime.set_rules(
            Resource::Receipt,
            MergeRules::new().with_rule("total", FieldRule::Custom { resolver: "max".into() }),
        );
        runtime.register_resolver(
            "max",
            Arc::new(|_, local, server| {
                Some(json!(local.as_i64().unwrap_or(0).max(server.as_i64().unwrap_or(0))))
            }),
        );

        let conflict = ConflictPayload {
            server_data: json!({"total": 70}),
            ..ConflictPayload::default()
        };
        let resolution = runtime.handle(&item(json!({"total": 50}), None), &conflict);
        assert_eq!(resolution.data["total"], 70);
        assert!((resolution.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_returns_default_and_commits_on_timeout() {
        let (runtime, events) = runtime(ConflictStrategy::Manual);
        let mut rx = events.subscribe();

        let local = json!({"v": "local"});
        let conflict =
            ConflictPayload { server_data: json!({"v": "server"}), ..ConflictPayload::default() };

        let interim = runtime.handle(&item(local, None), &conflict);
        assert_eq!(interim.data, json!({"v": "server"}));
        assert!(interim.requires_user_input);
        assert_eq!(runtime.pending_manual_count(), 1);

        // Let the window elapse.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(runtime.pending_manual_count(), 0);

        let event = rx.recv().await.unwrap();
        match event {
            SdkEvent::ConflictResolved { strategy, timed_out, .. } => {
                assert_eq!(strategy, ConflictStrategy::ServerWins);
                assert!(timed_out);
            }
            other => panic!("unexpected event {other:?}"),
        }
        let history = runtime.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].resolution.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_applies_user_choice_before_timeout() {
        let (runtime, _) = runtime(ConflictStrategy::Manual);
        let local = json!({"v": "local"});
        let conflict =
            ConflictPayload { server_data: json!({"v": "server"}), ..ConflictPayload::default() };

        let _interim = runtime.handle(&item(local.clone(), None), &conflict);
        assert!(runtime.submit_manual_resolution("q-1", ConflictStrategy::ClientWins));

        // Give the parked task a chance to run.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let history = runtime.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].resolution.strategy, ConflictStrategy::ClientWins);
        assert_eq!(history[0].resolution.data, local);
        assert!(!history[0].resolution.timed_out);

        // Nothing left to submit to.
        assert!(!runtime.submit_manual_resolution("q-1", ConflictStrategy::ServerWins));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_data_classification_flows_through() {
        let (runtime, _) = runtime(ConflictStrategy::ServerWins);
        // Item updated_at far behind the clock (10_000 vs threshold 300_000):
        // use a runtime whose clock is past the stale threshold.
        let events = EventBus::new();
        let stale_runtime = ConflictResolverRuntime::new(
            ConflictStrategy::ServerWins,
            300_000,
            1_000,
            Arc::new(ManualClock::new(400_000)),
            events,
        );
        drop(runtime);

        let conflict =
            ConflictPayload { server_data: json!({}), ..ConflictPayload::default() };
        stale_runtime.handle(&item(json!({}), None), &conflict);
        assert_eq!(stale_runtime.history()[0].class, ConflictClass::StaleData);
    }

    #[tokio::test(start_paused = true)]
    async fn history_ring_is_bounded() {
        let (runtime, _) = runtime(ConflictStrategy::ServerWins);
        let conflict =
            ConflictPayload { server_data: json!({}), ..ConflictPayload::default() };
        for n in 0..120 {
            let mut it = item(json!({}), None);
            it.id = format!("q-{n}");
            runtime.handle(&it, &conflict);
        }
        let history = runtime.history();
        assert_eq!(history.len(), HISTORY_CAP);
        assert_eq!(history.last().unwrap().item_id, "q-119");
    }
}
