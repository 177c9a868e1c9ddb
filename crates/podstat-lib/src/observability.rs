//! Observability infrastructure for the aggregation engine
//!
//! Provides:
//! - Prometheus metrics (watch sessions, processed events, cache efficiency, tick latency)
//! - Structured JSON logging of watch and agent lifecycle events

use crate::models::{ClusterId, ResourceKind};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for supervisor tick latency (in seconds)
const TICK_LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PodStatMetricsInner> = OnceLock::new();

struct PodStatMetricsInner {
    supervisor_tick_seconds: Histogram,
    watch_sessions_active: IntGauge,
    watch_start_failures: IntCounter,
    watch_events: IntCounterVec,
    conversion_failures: IntCounter,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    cache_entries: IntGauge,
}

impl PodStatMetricsInner {
    fn new() -> Self {
        Self {
            supervisor_tick_seconds: register_histogram!(
                "podstat_supervisor_tick_seconds",
                "Time spent in one watch supervisor tick",
                TICK_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register supervisor_tick_seconds"),

            watch_sessions_active: register_int_gauge!(
                "podstat_watch_sessions_active",
                "Number of running cluster watch sessions"
            )
            .expect("Failed to register watch_sessions_active"),

            watch_start_failures: register_int_counter!(
                "podstat_watch_start_failures_total",
                "Total number of failed watch establishments"
            )
            .expect("Failed to register watch_start_failures"),

            watch_events: register_int_counter_vec!(
                "podstat_watch_events_total",
                "Watch events applied, by event type",
                &["type"]
            )
            .expect("Failed to register watch_events"),

            conversion_failures: register_int_counter!(
                "podstat_conversion_failures_total",
                "Watch payloads that could not be converted into a pod"
            )
            .expect("Failed to register conversion_failures"),

            cache_hits: register_int_counter!(
                "podstat_usage_cache_hits_total",
                "Resource usage cache hits"
            )
            .expect("Failed to register cache_hits"),

            cache_misses: register_int_counter!(
                "podstat_usage_cache_misses_total",
                "Resource usage cache misses"
            )
            .expect("Failed to register cache_misses"),

            cache_entries: register_int_gauge!(
                "podstat_usage_cache_entries",
                "Entries currently held by the resource usage cache"
            )
            .expect("Failed to register cache_entries"),
        }
    }
}

/// Handle to the process-wide metrics; clones share the same collectors
#[derive(Clone)]
pub struct PodStatMetrics {
    _private: (),
}

impl Default for PodStatMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PodStatMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PodStatMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PodStatMetricsInner {
        GLOBAL_METRICS.get_or_init(PodStatMetricsInner::new)
    }

    pub fn observe_tick_latency(&self, duration_secs: f64) {
        self.inner().supervisor_tick_seconds.observe(duration_secs);
    }

    pub fn set_watch_sessions(&self, count: i64) {
        self.inner().watch_sessions_active.set(count);
    }

    pub fn inc_watch_start_failures(&self) {
        self.inner().watch_start_failures.inc();
    }

    /// Count one applied event; `event_type` is `added`, `modified` or `deleted`
    pub fn inc_watch_event(&self, event_type: &str) {
        self.inner()
            .watch_events
            .with_label_values(&[event_type])
            .inc();
    }

    pub fn inc_conversion_failures(&self) {
        self.inner().conversion_failures.inc();
    }

    pub fn inc_cache_hit(&self) {
        self.inner().cache_hits.inc();
    }

    pub fn inc_cache_miss(&self) {
        self.inner().cache_misses.inc();
    }

    pub fn set_cache_entries(&self, count: i64) {
        self.inner().cache_entries.set(count);
    }
}

/// Structured logger for watch and agent lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_watch_started(&self, cluster: &ClusterId, kind: ResourceKind) {
        info!(
            event = "watch_started",
            instance = %self.instance,
            cluster = %cluster,
            kind = %kind,
            "Cluster watch started"
        );
    }

    /// Log the end of a watch; `failed` distinguishes errors from a server close
    pub fn log_watch_stopped(&self, cluster: &ClusterId, kind: ResourceKind, failed: bool, reason: &str) {
        if failed {
            warn!(
                event = "watch_stopped",
                instance = %self.instance,
                cluster = %cluster,
                kind = %kind,
                failed = true,
                reason = %reason,
                "Cluster watch failed, will restart on next tick"
            );
        } else {
            info!(
                event = "watch_stopped",
                instance = %self.instance,
                cluster = %cluster,
                kind = %kind,
                failed = false,
                reason = %reason,
                "Cluster watch closed, will restart on next tick"
            );
        }
    }

    pub fn log_watch_start_failed(&self, cluster: &ClusterId, kind: ResourceKind, error: &str) {
        warn!(
            event = "watch_start_failed",
            instance = %self.instance,
            cluster = %cluster,
            kind = %kind,
            error = %error,
            "Failed to start cluster watch"
        );
    }

    pub fn log_startup(&self, version: &str, clusters: usize) {
        info!(
            event = "agent_started",
            instance = %self.instance,
            agent_version = %version,
            clusters = clusters,
            "Podstat agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Podstat agent shutting down"
        );
    }
}
