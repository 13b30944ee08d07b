// src/metrics/mod.rs
// Prometheus metrics for the gateway core

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing::info;

/// Global Prometheus handle for metrics rendering
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder. Safe to call once per
/// process; transports expose `render_metrics` however they like.
pub fn init_metrics() {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    PROMETHEUS_HANDLE
        .set(handle)
        .expect("Prometheus handle already initialized");

    info!("Prometheus metrics initialized");
}

/// Render the current metrics in Prometheus exposition format.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Record a routed query (counter)
pub fn record_query(kind: &str, cached: bool) {
    let source = if cached { "cache" } else { "engine" };
    counter!("conceptgate_queries_total", "kind" => kind.to_string(), "source" => source)
        .increment(1);
}

/// Record end-to-end query duration (histogram)
pub fn record_query_duration(kind: &str, duration_ms: u64) {
    histogram!("conceptgate_query_duration_ms", "kind" => kind.to_string())
        .record(duration_ms as f64);
}

/// Record one branch's latency
pub fn record_branch_latency(layer: &str, duration_ms: u64) {
    histogram!("conceptgate_branch_latency_ms", "layer" => layer.to_string())
        .record(duration_ms as f64);
}

/// Record cache hit/miss
pub fn record_cache_result(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("conceptgate_cache_total", "result" => result).increment(1);
}

/// Record a quota rejection
pub fn record_quota_rejection(resource: &str) {
    counter!("conceptgate_quota_rejections_total", "resource" => resource.to_string())
        .increment(1);
}

/// Record an upstream retry
pub fn record_upstream_retry(operation: &str) {
    counter!("conceptgate_upstream_retries_total", "operation" => operation.to_string())
        .increment(1);
}

/// Record a synchronizer batch
pub fn record_sync_batch(direction: &str, applied: usize, failed: usize) {
    counter!("conceptgate_sync_items_total", "direction" => direction.to_string(), "outcome" => "applied")
        .increment(applied as u64);
    counter!("conceptgate_sync_items_total", "direction" => direction.to_string(), "outcome" => "failed")
        .increment(failed as u64);
}

/// Track the current evolution phase
pub fn record_phase(phase: u8) {
    gauge!("conceptgate_evolution_phase").set(phase as f64);
}
