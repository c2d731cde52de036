//! Metrics registry for engine observability
//!
//! Provides OpenTelemetry metrics for:
//! - Recipe selection outcomes
//! - Model cache occupancy, hits, misses, and evictions
//! - Instance lifecycle transitions and readiness latency
//!
//! Instruments are no-ops until a meter provider is installed by
//! [`crate::telemetry::init_telemetry`].

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("aim"));

// ============================================================================
// Selection Metrics
// ============================================================================

/// Counter of recipe resolutions
///
/// Labels:
/// - `result`: selected, model_not_found, no_matching_gpu_count, constraint_conflict, invalid
pub static SELECTIONS_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("aim_selections_total")
        .with_description("Total number of recipe resolutions by outcome")
        .with_unit("{selections}")
        .build()
});

// ============================================================================
// Cache Metrics
// ============================================================================

/// Gauge of bytes currently accounted to the cache (ready plus reserved)
pub static CACHE_BYTES: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("aim_cache_bytes")
        .with_description("Bytes used by cached and reserved model artifacts")
        .with_unit("By")
        .build()
});

/// Gauge of configured cache capacity
pub static CACHE_CAPACITY_BYTES: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("aim_cache_capacity_bytes")
        .with_description("Configured model cache capacity")
        .with_unit("By")
        .build()
});

/// Gauge of entries in the cache
pub static CACHE_ENTRIES: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("aim_cache_entries")
        .with_description("Number of cache entries")
        .with_unit("{entries}")
        .build()
});

/// Counter of cache hits
pub static CACHE_HITS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("aim_cache_hits_total")
        .with_description("Ensure calls served from a ready entry")
        .with_unit("{requests}")
        .build()
});

/// Counter of cache misses (fetch required)
pub static CACHE_MISSES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("aim_cache_misses_total")
        .with_description("Ensure calls that required a fetch")
        .with_unit("{requests}")
        .build()
});

/// Counter of evicted entries
///
/// Labels:
/// - `reason`: capacity, expired, manual
pub static CACHE_EVICTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("aim_cache_evictions_total")
        .with_description("Cache entries removed")
        .with_unit("{entries}")
        .build()
});

// ============================================================================
// Instance Lifecycle Metrics
// ============================================================================

/// Gauge of tracked instances
///
/// Labels:
/// - `state`: pending, starting, running, stopping, stopped, failed
pub static INSTANCES: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("aim_instances")
        .with_description("Instances known to the orchestrator by lifecycle state")
        .with_unit("{instances}")
        .build()
});

/// Counter of lifecycle transitions
///
/// Labels:
/// - `from`, `to`: pending, starting, running, stopping, stopped, failed
pub static INSTANCE_TRANSITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("aim_instance_transitions_total")
        .with_description("Instance lifecycle transitions by target state")
        .with_unit("{transitions}")
        .build()
});

/// Histogram of time from launch to Running
///
/// Labels:
/// - `backend`: vllm, sglang
pub static LAUNCH_READY_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("aim_launch_ready_seconds")
        .with_description("Time from launch request until the instance passed its health check")
        .with_unit("s")
        .build()
});

/// Counter of failed health probes
pub static HEALTH_CHECK_FAILURES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("aim_health_check_failures_total")
        .with_description("Health probes that did not report ready")
        .with_unit("{probes}")
        .build()
});

/// Record one resolution outcome
pub fn record_selection(result: &str) {
    SELECTIONS_TOTAL.add(1, &[KeyValue::new("result", result.to_string())]);
}

/// Publish cache occupancy gauges
pub fn record_cache_usage(used_bytes: u64, capacity_bytes: u64, entries: u64) {
    CACHE_BYTES.record(used_bytes, &[]);
    CACHE_CAPACITY_BYTES.record(capacity_bytes, &[]);
    CACHE_ENTRIES.record(entries, &[]);
}

/// Record an eviction with its reason
pub fn record_eviction(reason: &str) {
    CACHE_EVICTIONS.add(1, &[KeyValue::new("reason", reason.to_string())]);
}

/// Record a lifecycle transition
pub fn record_transition(from: &str, to: &str) {
    INSTANCE_TRANSITIONS.add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}

/// Publish the per-state instance counts
pub fn record_instance_counts<'a>(counts: impl IntoIterator<Item = (&'a str, u64)>) {
    for (state, count) in counts {
        INSTANCES.record(count, &[KeyValue::new("state", state.to_string())]);
    }
}

/// Times a launch from request to Running.
pub struct ReadyTimer {
    backend: String,
    start: std::time::Instant,
}

impl ReadyTimer {
    /// Start timing a launch
    pub fn start(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record that the instance became ready
    pub fn ready(self) {
        LAUNCH_READY_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("backend", self.backend)],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_provider_is_a_noop() {
        record_selection("selected");
        record_cache_usage(10, 100, 1);
        record_eviction("capacity");
        record_transition("starting", "running");
        record_instance_counts([("running", 1), ("failed", 0)]);
        CACHE_HITS.add(1, &[]);
        HEALTH_CHECK_FAILURES.add(1, &[]);
        ReadyTimer::start("vllm").ready();
    }
}
