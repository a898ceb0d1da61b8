//! Typed event bus.
//!
//! All observable SDK activity flows through one tagged [`SdkEvent`] enum on
//! a `tokio::sync::broadcast` channel. Emission never blocks and never fails:
//! with no subscribers the event is dropped, and a slow subscriber observes
//! `RecvError::Lagged` rather than back-pressuring the emitter. Subscribers
//! should ignore variants they do not understand.

use acube_core::conflict::ConflictStrategy;
use acube_core::types::Resource;
use tokio::sync::broadcast;

use crate::error::ErrorReport;
use crate::sync::analytics::MetricsReport;

/// Default bus capacity. Lagging subscribers lose the oldest events first.
const CHANNEL_CAPACITY: usize = 256;

/// Every event the SDK emits.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SdkEvent {
    // -- auth --
    LoginStart { email: String },
    LoginSuccess { user_id: String },
    Logout { reason: Option<String> },
    SessionCreated { session_id: String },
    SessionRestored { user_id: String },
    RoleChanged { user_id: String },
    RefreshStart,
    RefreshSuccess { expires_at: i64 },
    RefreshFailure { attempt: u32, error: ErrorReport },
    /// The refresh cycle gave up; the session is over.
    TokenExpired,

    // -- storage --
    StorageError { key: Option<String>, error: ErrorReport },

    // -- queue --
    QueueEnqueued { id: String, resource: Resource },
    QueueCompleted { id: String, resource: Resource, duration_ms: u64 },
    QueueFailed { id: String, resource: Resource, error: ErrorReport },
    QueueDead { id: String, reason: String },
    /// A pending low-priority item was dropped to admit a higher-priority one.
    QueueEvicted { id: String },
    QueuePaused,
    QueueResumed,
    QueueDrained { processed: usize },
    BreakerOpened { resource: Resource },
    BreakerHalfOpen { resource: Resource },
    BreakerClosed { resource: Resource },
    ConflictResolved {
        item_id: String,
        strategy: ConflictStrategy,
        confidence: f64,
        timed_out: bool,
    },

    // -- analytics --
    PerformanceMetrics(Box<MetricsReport>),
}

/// Cloneable handle to the broadcast bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SdkEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Emits an event. A send error only means nobody is listening.
    pub fn emit(&self, event: SdkEvent) {
        let _ = self.tx.send(event);
    }

    /// Opens a new subscription starting at the current position.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SdkEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
