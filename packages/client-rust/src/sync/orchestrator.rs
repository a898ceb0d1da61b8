//! Queue orchestration: the processing loop.
//!
//! On every tick the orchestrator promotes due scheduled items, pulls ready
//! items in dispatch order, groups them through the batch planner, and
//! dispatches each batch to the processor registered for its
//! `(resource, operation)` pair. Success and failure feed the breaker, the
//! retry scheduler, and analytics; conflicts go through the resolver runtime.
//!
//! Connectivity gates dispatch: while offline nothing is sent, and the flip
//! back to online triggers an immediate drain. Pausing prevents new dispatch
//! without cancelling in-flight items.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use acube_core::clock::ClockSource;
use acube_core::planner::BatchPlanner;
use acube_core::types::{Batch, BatchMode, ItemStatus, OperationKind, QueueItem, Resource};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::SdkError;
use crate::events::{EventBus, SdkEvent};
use crate::sync::analytics::{Analytics, CacheHitRates, MetricsReport};
use crate::sync::breaker::CircuitBreakerRegistry;
use crate::sync::conflicts::{ConflictPayload, ConflictResolverRuntime};
use crate::sync::queue::{ItemPatch, NewItem, PersistentQueue, QueueStatsSnapshot};
use crate::sync::retry_scheduler::{GiveUpReason, RetryDecision, RetryScheduler};

/// Failure modes a processor can report.
#[derive(Debug)]
pub enum ProcessorError {
    /// Plain failure with a classifiable error code.
    Failed { code: String, message: String },
    /// The server reported a conflict; evidence attached.
    Conflict(ConflictPayload),
}

/// Caller-supplied executor for one `(resource, operation)` pair.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Executes the item against the remote service.
    async fn process(&self, item: &QueueItem) -> Result<Value, ProcessorError>;
}

/// Combined view returned by [`QueueOrchestrator::stats`].
#[derive(Debug, Clone)]
pub struct OrchestratorStats {
    pub queue: QueueStatsSnapshot,
    pub metrics: MetricsReport,
    pub online: bool,
    pub paused: bool,
}

/// Collaborators wired in at construction.
pub struct OrchestratorDeps {
    pub queue: Arc<PersistentQueue>,
    pub breaker: Arc<CircuitBreakerRegistry>,
    pub conflicts: Arc<ConflictResolverRuntime>,
    pub analytics: Arc<Analytics>,
    pub events: EventBus,
    pub clock: Arc<dyn ClockSource>,
}

/// Owns the processing loop and all queue mutations.
pub struct QueueOrchestrator {
    queue: Arc<PersistentQueue>,
    planner: BatchPlanner,
    breaker: Arc<CircuitBreakerRegistry>,
    retry: RetryScheduler,
    conflicts: Arc<ConflictResolverRuntime>,
    analytics: Arc<Analytics>,
    processors: DashMap<(Resource, OperationKind), Arc<dyn Processor>>,
    events: EventBus,
    clock: Arc<dyn ClockSource>,
    config: QueueConfig,
    online_tx: watch::Sender<bool>,
    /// Wakes the loop for an immediate tick (enqueue while online).
    kick: Arc<tokio::sync::Notify>,
    paused: AtomicBool,
    destroyed: AtomicBool,
    tick_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Hit-rate sources for the metrics report; optional in tests.
    hit_rates: Mutex<Option<Box<dyn Fn() -> CacheHitRates + Send>>>,
}

impl QueueOrchestrator {
    #[must_use]
    pub fn new(
        deps: OrchestratorDeps,
        planner: BatchPlanner,
        config: QueueConfig,
    ) -> Arc<Self> {
        let retry = RetryScheduler::new(&config, deps.clock.clone());
        let (online_tx, _) = watch::channel(true);
        Arc::new(Self {
            queue: deps.queue,
            planner,
            breaker: deps.breaker,
            retry,
            conflicts: deps.conflicts,
            analytics: deps.analytics,
            processors: DashMap::new(),
            events: deps.events,
            clock: deps.clock,
            config,
            online_tx,
            kick: Arc::new(tokio::sync::Notify::new()),
            paused: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            tick_task: Mutex::new(None),
            hit_rates: Mutex::new(None),
        })
    }

    /// Installs the closure used to sample cache hit rates for reports.
    pub fn set_hit_rate_source(&self, source: Box<dyn Fn() -> CacheHitRates + Send>) {
        *self.hit_rates.lock() = Some(source);
    }

    /// Registers the processor for a `(resource, operation)` pair.
    pub fn register_processor(
        &self,
        resource: Resource,
        operation: OperationKind,
        processor: Arc<dyn Processor>,
    ) {
        self.processors.insert((resource, operation), processor);
    }

    /// Spawns the background tick loop.
    pub fn start(self: &Arc<Self>) {
        let orchestrator = self.clone();
        let mut online_rx = self.online_tx.subscribe();
        let kick = self.kick.clone();
        let interval = self.config.processing_interval_ms.max(10);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(interval)) => {}
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *online_rx.borrow() {
                            info!("connectivity restored, draining queue");
                        }
                    }
                    () = kick.notified() => {}
                }
                if orchestrator.destroyed.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) = orchestrator.tick().await {
                    warn!(%err, "processing tick failed");
                }
                orchestrator.emit_metrics();
            }
        });
        *self.tick_task.lock() = Some(task);
    }

    // -- connectivity and lifecycle ----------------------------------------

    /// Updates the connectivity signal. Going online triggers a drain.
    pub fn set_online(&self, online: bool) {
        // send_replace updates the value even with no live receivers (the
        // loop may not have been started yet).
        self.online_tx.send_replace(online);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    /// Stops new dispatch; in-flight items finish normally.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.events.emit(SdkEvent::QueuePaused);
    }

    /// Resumes dispatch.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.events.emit(SdkEvent::QueueResumed);
        self.kick.notify_one();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Stops the loop. Pending items stay queued (and persisted).
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        if let Some(task) = self.tick_task.lock().take() {
            task.abort();
        }
    }

    // -- queue proxies ------------------------------------------------------

    /// Adds an operation to the queue; when online and unpaused, the loop is
    /// kicked for immediate dispatch.
    ///
    /// # Errors
    ///
    /// See [`PersistentQueue::enqueue`].
    pub async fn enqueue(&self, new: NewItem) -> Result<QueueItem, SdkError> {
        let item = self.queue.enqueue(new).await?;
        if self.is_online() && !self.is_paused() {
            self.kick.notify_one();
        }
        Ok(item)
    }

    /// Removes an item from the queue.
    ///
    /// # Errors
    ///
    /// See [`PersistentQueue::dequeue`].
    pub async fn dequeue(&self, id: &str) -> Result<Option<QueueItem>, SdkError> {
        self.queue.dequeue(id).await
    }

    /// Patches an item.
    ///
    /// # Errors
    ///
    /// See [`PersistentQueue::update`].
    pub async fn update(&self, id: &str, patch: ItemPatch) -> Result<QueueItem, SdkError> {
        self.queue.update(id, patch).await
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<QueueItem> {
        self.queue.get(id)
    }

    /// Opens an event subscription.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SdkEvent> {
        self.events.subscribe()
    }

    /// Queue, metrics, and loop state.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> OrchestratorStats {
        let queue = self.queue.stats();
        let pressure = if queue.max_size == 0 {
            0.0
        } else {
            queue.total as f64 / queue.max_size as f64
        };
        let rates = self
            .hit_rates
            .lock()
            .as_ref()
            .map_or(CacheHitRates { permissions: 1.0, storage: 1.0 }, |f| f());
        OrchestratorStats {
            metrics: self.analytics.snapshot(queue.total, pressure, rates),
            queue,
            online: self.is_online(),
            paused: self.is_paused(),
        }
    }

    fn emit_metrics(&self) {
        let stats = self.stats();
        self.events.emit(SdkEvent::PerformanceMetrics(Box::new(stats.metrics)));
    }

    // -- processing ---------------------------------------------------------

    /// Processes ready items until none remain (or connectivity/pause stops
    /// dispatch). Returns how many items were handed to processors.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] when queue persistence fails.
    pub async fn drain(self: &Arc<Self>) -> Result<usize, SdkError> {
        let mut processed = 0;
        loop {
            let n = self.tick().await?;
            processed += n;
            if n == 0 {
                break;
            }
        }
        self.events.emit(SdkEvent::QueueDrained { processed });
        Ok(processed)
    }

    /// One processing round: promote, plan, dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::Storage`] when queue persistence fails.
    pub async fn tick(self: &Arc<Self>) -> Result<usize, SdkError> {
        if self.is_paused() || !self.is_online() || self.destroyed.load(Ordering::SeqCst) {
            return Ok(0);
        }

        self.queue.promote_scheduled().await?;
        let ready = self.queue.peek_ready(self.config.batch_size);
        if ready.is_empty() {
            return Ok(0);
        }

        let now = self.clock.now_ms();
        let ready_refs: Vec<&QueueItem> = ready.iter().collect();
        let mut open = Vec::new();
        let mut batches = self.planner.plan(&ready_refs, &mut open, now, || {
            format!("batch-{}", Uuid::new_v4())
        });
        batches.extend(open);

        let mut dispatched = 0;
        for batch in batches {
            dispatched += self.dispatch_batch(&batch).await;
        }
        Ok(dispatched)
    }

    /// Dispatches one batch under its lifetime bound.
    async fn dispatch_batch(self: &Arc<Self>, batch: &Batch) -> usize {
        debug!(batch_id = %batch.id, items = batch.item_ids.len(), mode = ?batch.mode, "dispatching batch");
        let lifetime = Duration::from_millis(self.config.batch_timeout_ms.max(1));

        let run = self.run_batch(batch);
        let outcome = tokio::time::timeout(lifetime, run).await;

        match outcome {
            Ok(count) => count,
            Err(_) => {
                warn!(batch_id = %batch.id, "batch exceeded its lifetime, failing members");
                // Members caught mid-flight become retry candidates; members
                // never started stay pending.
                let mut touched = 0;
                for id in &batch.item_ids {
                    let Some(item) = self.queue.get(id) else { continue };
                    if item.status == ItemStatus::Processing {
                        self.handle_failure(id, "TIMEOUT", "batch lifetime exceeded").await;
                        touched += 1;
                    }
                }
                touched
            }
        }
    }

    async fn run_batch(self: &Arc<Self>, batch: &Batch) -> usize {
        let mut processed = 0;
        match batch.mode {
            BatchMode::Sequential => {
                for id in &batch.item_ids {
                    processed += usize::from(self.dispatch_item(id).await);
                }
            }
            BatchMode::Parallel { max_concurrency } => {
                let mut join_set: JoinSet<bool> = JoinSet::new();
                for id in &batch.item_ids {
                    if join_set.len() >= max_concurrency.max(1) {
                        if let Some(Ok(done)) = join_set.join_next().await {
                            processed += usize::from(done);
                        }
                    }
                    let orchestrator = self.clone();
                    let id = id.clone();
                    join_set.spawn(async move { orchestrator.dispatch_item(&id).await });
                }
                while let Some(result) = join_set.join_next().await {
                    if let Ok(done) = result {
                        processed += usize::from(done);
                    }
                }
            }
        }
        processed
    }

    /// Dispatches a single item. Returns whether a processor ran.
    async fn dispatch_item(self: &Arc<Self>, id: &str) -> bool {
        let Some(item) = self.queue.get(id) else { return false };
        if item.status != ItemStatus::Pending {
            return false;
        }

        // Breaker gate: an open circuit skips the processor entirely and
        // parks the item until the probe window.
        if !self.breaker.allow_request(item.resource) {
            let until = self
                .breaker
                .state(item.resource)
                .next_probe_at
                .unwrap_or_else(|| self.clock.now_ms() + 1_000);
            debug!(id, resource = item.resource.as_str(), "breaker open, deferring");
            let _ = self
                .queue
                .update(id, ItemPatch { scheduled_at: Some(Some(until)), ..ItemPatch::default() })
                .await;
            return false;
        }

        let Some(processor) = self
            .processors
            .get(&(item.resource, item.operation))
            .map(|p| p.value().clone())
        else {
            warn!(id, resource = item.resource.as_str(), op = item.operation.as_str(), "no processor registered");
            let _ = self.queue.mark_dead(id, "no_processor").await;
            return false;
        };

        if self.queue.transition(id, ItemStatus::Processing).await.is_err() {
            return false;
        }

        let started = self.clock.now_ms();
        let result = processor.process(&item).await;
        let duration_ms = u64::try_from(self.clock.now_ms() - started).unwrap_or(0);

        match result {
            Ok(_) => {
                let _ = self.queue.transition(id, ItemStatus::Completed).await;
                self.breaker.record_success(item.resource);
                self.analytics.record_dispatch(item.resource, item.priority, duration_ms, true);
                self.events.emit(SdkEvent::QueueCompleted {
                    id: id.to_string(),
                    resource: item.resource,
                    duration_ms,
                });
            }
            Err(ProcessorError::Conflict(payload)) => {
                // The server answered, so the resource is healthy; reconcile
                // and complete with the resolved payload.
                let resolution = self.conflicts.handle(&item, &payload);
                let _ = self
                    .queue
                    .update(
                        id,
                        ItemPatch { payload: Some(resolution.data.clone()), ..ItemPatch::default() },
                    )
                    .await;
                let _ = self.queue.transition(id, ItemStatus::Completed).await;
                self.breaker.record_success(item.resource);
                self.analytics.record_dispatch(item.resource, item.priority, duration_ms, true);
                self.events.emit(SdkEvent::QueueCompleted {
                    id: id.to_string(),
                    resource: item.resource,
                    duration_ms,
                });
            }
            Err(ProcessorError::Failed { code, message }) => {
                self.analytics.record_dispatch(item.resource, item.priority, duration_ms, false);
                self.events.emit(SdkEvent::QueueFailed {
                    id: id.to_string(),
                    resource: item.resource,
                    error: SdkError::Network { message: message.clone() }
                        .report(self.clock.now_ms()),
                });
                self.handle_failure(id, &code, &message).await;
            }
        }
        true
    }

    /// Failure bookkeeping shared by processor errors and batch timeouts.
    async fn handle_failure(self: &Arc<Self>, id: &str, code: &str, message: &str) {
        if self.queue.mark_failed(id, code).await.is_err() {
            return;
        }
        if let Some(item) = self.queue.get(id) {
            if self.breaker.record_failure(item.resource) {
                self.analytics.record_breaker_trip();
            }

            match self.retry.schedule_retry(&item, code, &self.breaker) {
                RetryDecision::Retry { at, .. } => {
                    debug!(id, at, code, "retry scheduled");
                    self.analytics.record_retry();
                    let _ = self.queue.retry_later(id, at, true).await;
                }
                RetryDecision::Blocked { until } => {
                    debug!(id, until, "breaker open, parked without spending budget");
                    let _ = self.queue.retry_later(id, until, false).await;
                }
                RetryDecision::GiveUp { reason } => {
                    let reason = match reason {
                        GiveUpReason::MaxRetriesExceeded => "max_retries_exceeded".to_string(),
                        GiveUpReason::NonRetryable => format!("non_retryable: {message}"),
                    };
                    let _ = self.queue.mark_dead(id, &reason).await;
                }
            }
        }
    }
}
