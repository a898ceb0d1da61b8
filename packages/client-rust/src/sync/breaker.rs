//! Per-resource circuit breakers.
//!
//! Transitions: `closed -> open` after `failure_threshold` consecutive
//! failures; `open -> half-open` at the first decision point past
//! `next_probe_at`; `half-open -> closed` after `success_threshold`
//! consecutive successes; `half-open -> open` on any failure, restarting the
//! cooldown. While half-open, only a single probe may be in flight.
//!
//! Only the queue orchestrator writes breaker state; everything else observes
//! through snapshots and events.

use std::collections::HashMap;

use acube_core::clock::ClockSource;
use acube_core::types::Resource;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::BreakerConfig;
use crate::events::{EventBus, SdkEvent};

/// Breaker state for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Circuit {
    Closed,
    Open,
    HalfOpen,
}

/// Read-only view of one resource's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub circuit: Circuit,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_at: Option<i64>,
    pub next_probe_at: Option<i64>,
}

#[derive(Debug)]
struct ResourceBreaker {
    circuit: Circuit,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<i64>,
    next_probe_at: Option<i64>,
    probe_in_flight: bool,
}

impl ResourceBreaker {
    fn new() -> Self {
        Self {
            circuit: Circuit::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
            next_probe_at: None,
            probe_in_flight: false,
        }
    }
}

/// All breakers, keyed by resource.
pub struct CircuitBreakerRegistry {
    states: RwLock<HashMap<Resource, ResourceBreaker>>,
    default_config: BreakerConfig,
    overrides: HashMap<Resource, BreakerConfig>,
    clock: Arc<dyn ClockSource>,
    events: EventBus,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(
        default_config: BreakerConfig,
        clock: Arc<dyn ClockSource>,
        events: EventBus,
    ) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            default_config,
            overrides: HashMap::new(),
            clock,
            events,
        }
    }

    /// Replaces the thresholds for one resource.
    #[must_use]
    pub fn with_override(mut self, resource: Resource, config: BreakerConfig) -> Self {
        self.overrides.insert(resource, config);
        self
    }

    fn config_for(&self, resource: Resource) -> &BreakerConfig {
        self.overrides.get(&resource).unwrap_or(&self.default_config)
    }

    /// Decision point before a dispatch. An `open` breaker whose cooldown
    /// elapsed moves to half-open and admits exactly one probe.
    pub fn allow_request(&self, resource: Resource) -> bool {
        let now = self.clock.now_ms();
        let mut states = self.states.write();
        let breaker = states.entry(resource).or_insert_with(ResourceBreaker::new);

        match breaker.circuit {
            Circuit::Closed => true,
            Circuit::Open => {
                if breaker.next_probe_at.is_some_and(|at| now >= at) {
                    info!(resource = resource.as_str(), "breaker half-open, probing");
                    breaker.circuit = Circuit::HalfOpen;
                    breaker.consecutive_successes = 0;
                    breaker.probe_in_flight = true;
                    self.events.emit(SdkEvent::BreakerHalfOpen { resource });
                    true
                } else {
                    false
                }
            }
            Circuit::HalfOpen => {
                if breaker.probe_in_flight {
                    false
                } else {
                    breaker.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Records a successful dispatch.
    pub fn record_success(&self, resource: Resource) {
        let mut states = self.states.write();
        let breaker = states.entry(resource).or_insert_with(ResourceBreaker::new);
        let success_threshold = self.config_for(resource).success_threshold;

        match breaker.circuit {
            Circuit::Closed => breaker.consecutive_failures = 0,
            Circuit::HalfOpen => {
                breaker.probe_in_flight = false;
                breaker.consecutive_successes += 1;
                if breaker.consecutive_successes >= success_threshold {
                    info!(resource = resource.as_str(), "breaker closed");
                    breaker.circuit = Circuit::Closed;
                    breaker.consecutive_failures = 0;
                    breaker.consecutive_successes = 0;
                    breaker.next_probe_at = None;
                    self.events.emit(SdkEvent::BreakerClosed { resource });
                }
            }
            // A late success from before the trip changes nothing.
            Circuit::Open => {}
        }
    }

    /// Records a failed dispatch. Returns `true` when this failure tripped
    /// the breaker open.
    pub fn record_failure(&self, resource: Resource) -> bool {
        let now = self.clock.now_ms();
        let mut states = self.states.write();
        let breaker = states.entry(resource).or_insert_with(ResourceBreaker::new);
        let config = self.config_for(resource);

        breaker.last_failure_at = Some(now);
        match breaker.circuit {
            Circuit::Closed => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= config.failure_threshold {
                    info!(resource = resource.as_str(), "breaker opened");
                    breaker.circuit = Circuit::Open;
                    breaker.next_probe_at = Some(now + i64::try_from(config.cooldown_ms).unwrap_or(i64::MAX));
                    self.events.emit(SdkEvent::BreakerOpened { resource });
                    true
                } else {
                    false
                }
            }
            Circuit::HalfOpen => {
                // One failed probe reopens and restarts the cooldown.
                info!(resource = resource.as_str(), "probe failed, breaker reopened");
                breaker.circuit = Circuit::Open;
                breaker.probe_in_flight = false;
                breaker.consecutive_successes = 0;
                breaker.next_probe_at = Some(now + i64::try_from(config.cooldown_ms).unwrap_or(i64::MAX));
                self.events.emit(SdkEvent::BreakerOpened { resource });
                true
            }
            Circuit::Open => false,
        }
    }

    /// Current snapshot for `resource`; closed when never touched.
    #[must_use]
    pub fn state(&self, resource: Resource) -> BreakerSnapshot {
        let states = self.states.read();
        states.get(&resource).map_or(
            BreakerSnapshot {
                circuit: Circuit::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure_at: None,
                next_probe_at: None,
            },
            |b| BreakerSnapshot {
                circuit: b.circuit,
                consecutive_failures: b.consecutive_failures,
                consecutive_successes: b.consecutive_successes,
                last_failure_at: b.last_failure_at,
                next_probe_at: b.next_probe_at,
            },
        )
    }

    /// Resets every breaker to closed.
    pub fn reset_all(&self) {
        self.states.write().clear();
    }
}
