//! Metrics collection and export for Convoy.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use convoy_core::{CacheStats, HubStats, PublishOutcome};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "convoy_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "convoy_connections_active";
    pub const FRAMES_TOTAL: &str = "convoy_frames_total";
    pub const FRAMES_BYTES: &str = "convoy_frames_bytes";
    pub const ROOMS_ACTIVE: &str = "convoy_rooms_active";
    pub const LOCATION_UPDATES_TOTAL: &str = "convoy_location_updates_total";
    pub const FANOUT_RECIPIENTS: &str = "convoy_fanout_recipients";
    pub const SNAPSHOT_REQUESTS_TOTAL: &str = "convoy_snapshot_requests_total";
    pub const CACHE_HITS: &str = "convoy_cache_hits";
    pub const CACHE_MISSES: &str = "convoy_cache_misses";
    pub const CACHE_FAILURES: &str = "convoy_cache_failures";
    pub const COMPLETIONS_TOTAL: &str = "convoy_completions_total";
    pub const LATENCY_SECONDS: &str = "convoy_latency_seconds";
    pub const ERRORS_TOTAL: &str = "convoy_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames processed");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of journey rooms");
    metrics::describe_counter!(
        names::LOCATION_UPDATES_TOTAL,
        "Location updates by outcome"
    );
    metrics::describe_histogram!(
        names::FANOUT_RECIPIENTS,
        "Connections reached per location patch"
    );
    metrics::describe_counter!(
        names::SNAPSHOT_REQUESTS_TOTAL,
        "Total number of snapshot requests"
    );
    metrics::describe_gauge!(names::CACHE_HITS, "Snapshot cache hits");
    metrics::describe_gauge!(names::CACHE_MISSES, "Snapshot cache misses");
    metrics::describe_gauge!(
        names::CACHE_FAILURES,
        "Cache backend failures absorbed by falling back to the registry"
    );
    metrics::describe_counter!(
        names::COMPLETIONS_TOTAL,
        "Completed instances handed to the completion feed"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record frame processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record the outcome of a location update.
pub fn record_location_update(outcome: &PublishOutcome) {
    let label = match outcome {
        PublishOutcome::Accepted { recipients, .. } => {
            histogram!(names::FANOUT_RECIPIENTS).record(*recipients as f64);
            "accepted"
        }
        PublishOutcome::Filtered => "filtered",
        PublishOutcome::Throttled { .. } => "throttled",
    };
    counter!(names::LOCATION_UPDATES_TOTAL, "outcome" => label).increment(1);
}

/// Record a location update that failed with an error.
pub fn record_location_rejected() {
    counter!(names::LOCATION_UPDATES_TOTAL, "outcome" => "rejected").increment(1);
}

/// Record a snapshot request.
pub fn record_snapshot_request() {
    counter!(names::SNAPSHOT_REQUESTS_TOTAL).increment(1);
}

/// Record a completion handed to the feed.
pub fn record_completion() {
    counter!(names::COMPLETIONS_TOTAL).increment(1);
}

/// Publish hub and cache gauges.
pub fn set_engine_stats(hub: HubStats, cache: CacheStats) {
    gauge!(names::ROOMS_ACTIVE).set(hub.room_count as f64);
    gauge!(names::CACHE_HITS).set(cache.hits as f64);
    gauge!(names::CACHE_MISSES).set(cache.misses as f64);
    gauge!(names::CACHE_FAILURES).set(cache.failures as f64);
}

/// Record an error.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
