use anyhow::Context;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Start the Prometheus HTTP exporter on `addr`.
/// After this call, any metrics recorded via the `metrics` crate
/// macros (counter!, histogram!, gauge!) are exported at /metrics.
pub fn init_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to start Prometheus metrics server")
}

// ── Refresh metrics ──────────────────────────────────────────────

pub fn record_refresh(trigger: &str, outcome: &str) {
    counter!("refresh_cycles_total", "trigger" => trigger.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Wall time of one fetch + commit cycle.
pub fn record_refresh_latency_ms(trigger: &str, latency_ms: f64) {
    histogram!("refresh_cycle_latency_ms", "trigger" => trigger.to_string())
        .record(latency_ms);
}

/// A trigger that joined an in-flight cycle instead of starting one.
pub fn record_coalesced(trigger: &str) {
    counter!("refresh_coalesced_total", "trigger" => trigger.to_string())
        .increment(1);
}

// ── Snapshot metrics ─────────────────────────────────────────────

pub fn record_snapshot(generation: u64, quotes: usize) {
    gauge!("snapshot_generation").set(generation as f64);
    gauge!("snapshot_quotes").set(quotes as f64);
}
