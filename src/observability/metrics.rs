//! Metrics collection and exposition.
//!
//! # Metrics
//! - `edge_requests_total` (counter): requests by method, status, cache result
//! - `edge_request_duration_seconds` (histogram): latency distribution
//! - `edge_cache_lookups_total` (counter): hit / miss / hit_for_pass
//! - `edge_cache_entries` (gauge): objects currently stored
//! - `edge_origin_fetches_total` (counter): origin attempts by backend and outcome
//! - `edge_collapsed_waiters_total` (counter): requests that joined a shared fetch
//! - `edge_revalidations_total` (counter): background refreshes started
//! - `edge_rate_limited_total` (counter): requests refused with 429
//! - `edge_restarts_total` (counter): restart actions taken
//! - `edge_backend_health` (gauge): 1=healthy, 0=sick

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, cache: &'static str, start: Instant) {
    counter!(
        "edge_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
        "cache" => cache
    )
    .increment(1);
    histogram!("edge_request_duration_seconds", "cache" => cache)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_cache_lookup(result: &'static str) {
    counter!("edge_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_cache_size(entries: usize) {
    gauge!("edge_cache_entries").set(entries as f64);
}

pub fn record_origin_fetch(backend: &str, outcome: &'static str) {
    counter!(
        "edge_origin_fetches_total",
        "backend" => backend.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_collapsed_waiter() {
    counter!("edge_collapsed_waiters_total").increment(1);
}

pub fn record_revalidation() {
    counter!("edge_revalidations_total").increment(1);
}

pub fn record_rate_limited() {
    counter!("edge_rate_limited_total").increment(1);
}

pub fn record_restart() {
    counter!("edge_restarts_total").increment(1);
}

pub fn record_backend_health(backend: &str, healthy: bool) {
    gauge!("edge_backend_health", "backend" => backend.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}
