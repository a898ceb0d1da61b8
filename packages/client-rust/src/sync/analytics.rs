//! Rolling queue analytics: throughput, success rate, health, bottlenecks.
//!
//! Samples are kept in a time-bounded window and pruned on write and on
//! snapshot. The health score is a weighted blend of success rate, queue
//! pressure, cache efficiency, and breaker stability, clamped to `[0, 1]`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use acube_core::clock::ClockSource;
use acube_core::types::{Priority, Resource};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Dominant limiting factor, when one stands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bottleneck {
    Backpressure,
    ResourceOverload,
    HighErrorRate,
    SlowProcessors,
}

/// Cache efficiency per domain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHitRates {
    pub permissions: f64,
    pub storage: f64,
}

/// Periodic metrics summary, also carried on `performance:metrics` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    /// Completed dispatches over the last 60 seconds.
    pub throughput_per_minute: u64,
    /// Successful share of dispatches in the window; 1.0 with no samples.
    pub success_rate: f64,
    pub average_processing_ms: f64,
    pub per_priority: BTreeMap<Priority, u64>,
    pub per_resource: BTreeMap<Resource, u64>,
    pub cache_hit_rates: CacheHitRates,
    pub breaker_trips: u64,
    pub retries_scheduled: u64,
    pub queue_depth: usize,
    /// Weighted health in `[0, 1]`.
    pub health_score: f64,
    pub bottleneck: Option<Bottleneck>,
}

struct Sample {
    at: i64,
    success: bool,
    duration_ms: u64,
    priority: Priority,
    resource: Resource,
}

/// Rolling collector. One instance per orchestrator.
pub struct Analytics {
    clock: Arc<dyn ClockSource>,
    window_ms: i64,
    samples: Mutex<VecDeque<Sample>>,
    trip_times: Mutex<VecDeque<i64>>,
    retries: AtomicU64,
    total_trips: AtomicU64,
}

impl Analytics {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>, window_ms: i64) -> Self {
        Self {
            clock,
            window_ms: window_ms.max(60_000),
            samples: Mutex::new(VecDeque::new()),
            trip_times: Mutex::new(VecDeque::new()),
            retries: AtomicU64::new(0),
            total_trips: AtomicU64::new(0),
        }
    }

    /// Records one dispatch outcome.
    pub fn record_dispatch(
        &self,
        resource: Resource,
        priority: Priority,
        duration_ms: u64,
        success: bool,
    ) {
        let now = self.clock.now_ms();
        metrics::histogram!("queue_dispatch_duration_ms").record(duration_ms as f64);
        metrics::counter!("queue_dispatches_total", "outcome" => if success { "success" } else { "failure" })
            .increment(1);

        let mut samples = self.samples.lock();
        samples.push_back(Sample { at: now, success, duration_ms, priority, resource });
        Self::prune(&mut samples, now - self.window_ms);
    }

    /// Records a scheduled retry.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("queue_retries_scheduled_total").increment(1);
    }

    /// Records a breaker trip (closed -> open).
    pub fn record_breaker_trip(&self) {
        let now = self.clock.now_ms();
        self.total_trips.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("breaker_trips_total").increment(1);
        let mut trips = self.trip_times.lock();
        trips.push_back(now);
        while trips.front().is_some_and(|&at| at < now - self.window_ms) {
            trips.pop_front();
        }
    }

    fn prune(samples: &mut VecDeque<Sample>, cutoff: i64) {
        while samples.front().is_some_and(|s| s.at < cutoff) {
            samples.pop_front();
        }
    }

    /// Builds the current report.
    ///
    /// `queue_pressure` is queue depth over capacity in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(
        &self,
        queue_depth: usize,
        queue_pressure: f64,
        cache_hit_rates: CacheHitRates,
    ) -> MetricsReport {
        let now = self.clock.now_ms();
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, now - self.window_ms);

        let total = samples.len();
        let successes = samples.iter().filter(|s| s.success).count();
        let success_rate = if total == 0 { 1.0 } else { successes as f64 / total as f64 };
        let average_processing_ms = if total == 0 {
            0.0
        } else {
            samples.iter().map(|s| s.duration_ms as f64).sum::<f64>() / total as f64
        };
        let throughput_per_minute =
            samples.iter().filter(|s| s.at >= now - 60_000).count() as u64;

        let mut per_priority = BTreeMap::new();
        let mut per_resource = BTreeMap::new();
        for sample in samples.iter() {
            *per_priority.entry(sample.priority).or_insert(0) += 1;
            *per_resource.entry(sample.resource).or_insert(0) += 1;
        }

        let trips_in_window = self.trip_times.lock().len() as u64;
        let breaker_health = 1.0 / (1.0 + trips_in_window as f64);
        let cache_health = (cache_hit_rates.permissions + cache_hit_rates.storage) / 2.0;
        let pressure = queue_pressure.clamp(0.0, 1.0);

        let health_score = (0.4 * success_rate
            + 0.2 * (1.0 - pressure)
            + 0.2 * cache_health
            + 0.2 * breaker_health)
            .clamp(0.0, 1.0);

        let error_rate = 1.0 - success_rate;
        let bottleneck = if total >= 5 && error_rate > 0.5 {
            Some(Bottleneck::HighErrorRate)
        } else if pressure > 0.8 {
            Some(Bottleneck::Backpressure)
        } else if trips_in_window > 0 {
            Some(Bottleneck::ResourceOverload)
        } else if total > 0 && average_processing_ms > 5_000.0 {
            Some(Bottleneck::SlowProcessors)
        } else {
            None
        };

        metrics::gauge!("queue_health_score").set(health_score);
        metrics::gauge!("queue_depth").set(queue_depth as f64);

        MetricsReport {
            throughput_per_minute,
            success_rate,
            average_processing_ms,
            per_priority,
            per_resource,
            cache_hit_rates,
            breaker_trips: self.total_trips.load(Ordering::Relaxed),
            retries_scheduled: self.retries.load(Ordering::Relaxed),
            queue_depth,
            health_score,
            bottleneck,
        }
    }
}

#[cfg(test)]
mod tests {
    use acube_core::clock::ManualClock;

    use super::*;

    fn analytics() -> (Analytics, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (Analytics::new(clock.clone(), 60_000), clock)
    }

    fn rates() -> CacheHitRates {
        CacheHitRates { permissions: 1.0, storage: 1.0 }
    }

    #[test]
    fn empty_window_is_healthy() {
        let (analytics, _) = analytics();
        let report = analytics.snapshot(0, 0.0, rates());
        assert!((report.success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(report.throughput_per_minute, 0);
        assert!(report.health_score > 0.9);
        assert_eq!(report.bottleneck, None);
    }

    #[test]
    fn success_rate_and_distributions() {
        let (analytics, _) = analytics();
        analytics.record_dispatch(Resource::Receipt, Priority::High, 100, true);
        analytics.record_dispatch(Resource::Receipt, Priority::Normal, 200, true);
        analytics.record_dispatch(Resource::Cashier, Priority::Normal, 300, false);

        let report = analytics.snapshot(3, 0.1, rates());
        assert!((report.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((report.average_processing_ms - 200.0).abs() < 1e-9);
        assert_eq!(report.throughput_per_minute, 3);
        assert_eq!(report.per_resource[&Resource::Receipt], 2);
        assert_eq!(report.per_priority[&Priority::Normal], 2);
    }

    #[test]
    fn old_samples_fall_out_of_the_window() {
        let (analytics, clock) = analytics();
        analytics.record_dispatch(Resource::Receipt, Priority::Normal, 10, false);

        clock.advance(61_000);
        analytics.record_dispatch(Resource::Receipt, Priority::Normal, 10, true);

        let report = analytics.snapshot(1, 0.0, rates());
        assert!((report.success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(report.throughput_per_minute, 1);
    }

    #[test]
    fn high_error_rate_wins_bottleneck_classification() {
        let (analytics, _) = analytics();
        for _ in 0..6 {
            analytics.record_dispatch(Resource::Receipt, Priority::Normal, 10, false);
        }
        analytics.record_breaker_trip();

        let report = analytics.snapshot(900, 0.9, rates());
        assert_eq!(report.bottleneck, Some(Bottleneck::HighErrorRate));
        assert!(report.health_score < 0.5);
    }

    #[test]
    fn backpressure_detected_on_deep_queue() {
        let (analytics, _) = analytics();
        analytics.record_dispatch(Resource::Receipt, Priority::Normal, 10, true);
        let report = analytics.snapshot(950, 0.95, rates());
        assert_eq!(report.bottleneck, Some(Bottleneck::Backpressure));
    }

    #[test]
    fn breaker_trips_mark_resource_overload() {
        let (analytics, _) = analytics();
        analytics.record_dispatch(Resource::Receipt, Priority::Normal, 10, true);
        analytics.record_breaker_trip();
        let report = analytics.snapshot(1, 0.0, rates());
        assert_eq!(report.bottleneck, Some(Bottleneck::ResourceOverload));
        assert_eq!(report.breaker_trips, 1);
    }

    #[test]
    fn slow_processors_detected() {
        let (analytics, _) = analytics();
        analytics.record_dispatch(Resource::Receipt, Priority::Normal, 10_000, true);
        let report = analytics.snapshot(1, 0.0, rates());
        assert_eq!(report.bottleneck, Some(Bottleneck::SlowProcessors));
    }

    #[test]
    fn retries_are_counted() {
        let (analytics, _) = analytics();
        analytics.record_retry();
        analytics.record_retry();
        assert_eq!(analytics.snapshot(0, 0.0, rates()).retries_scheduled, 2);
    }
}
