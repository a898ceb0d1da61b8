//! Retry decisions: policy delay, budget, breaker gating.

use std::sync::Arc;

use acube_core::clock::ClockSource;
use acube_core::retry::{classify_error_code, Backoff, ErrorDisposition, RetryPolicy};
use acube_core::types::QueueItem;
use rand::Rng;

use crate::config::QueueConfig;
use crate::sync::breaker::{Circuit, CircuitBreakerRegistry};

/// Why an item will not be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    MaxRetriesExceeded,
    NonRetryable,
}

/// Outcome of [`RetryScheduler::schedule_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry at `at`, consuming one unit of the retry budget.
    Retry { at: i64, delay_ms: u64 },
    /// The resource's breaker is open: park until the probe window without
    /// consuming the budget.
    Blocked { until: i64 },
    /// The item is done retrying and should go dead.
    GiveUp { reason: GiveUpReason },
}

/// Computes retry schedules for failed items.
pub struct RetryScheduler {
    policy: RetryPolicy,
    clock: Arc<dyn ClockSource>,
}

impl RetryScheduler {
    #[must_use]
    pub fn new(config: &QueueConfig, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            policy: RetryPolicy {
                backoff: Backoff::Exponential { factor: config.retry_backoff_factor },
                base_delay_ms: config.retry_base_delay_ms,
                max_delay_ms: config.retry_max_delay_ms,
                jitter: true,
            },
            clock,
        }
    }

    /// Decides what happens to `item` after a failure with `error_code`.
    #[must_use]
    pub fn schedule_retry(
        &self,
        item: &QueueItem,
        error_code: &str,
        breaker: &CircuitBreakerRegistry,
    ) -> RetryDecision {
        if classify_error_code(error_code) == ErrorDisposition::Fatal {
            return RetryDecision::GiveUp { reason: GiveUpReason::NonRetryable };
        }
        if item.retry_count >= item.max_retries {
            return RetryDecision::GiveUp { reason: GiveUpReason::MaxRetriesExceeded };
        }

        let now = self.clock.now_ms();
        let snapshot = breaker.state(item.resource);
        if snapshot.circuit == Circuit::Open {
            let until = snapshot
                .next_probe_at
                .unwrap_or_else(|| now + i64::try_from(self.policy.base_delay_ms).unwrap_or(i64::MAX));
            return RetryDecision::Blocked { until };
        }

        let base = self.policy.delay_for_attempt(item.retry_count + 1);
        let delay_ms = self.policy.jittered(base, rand::rng().random::<f64>());
        RetryDecision::Retry {
            at: now + i64::try_from(delay_ms).unwrap_or(i64::MAX),
            delay_ms,
        }
    }
}
