//! Controller metrics
//!
//! Reconciliation outcomes, upstream size, node events and watch restarts,
//! kept in a dedicated registry and rendered in the Prometheus text format.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Controller metrics registry
    pub static ref SYNC_METRICS_REGISTRY: Registry = Registry::new();

    /// Reconciliation cycle duration
    static ref RECONCILIATION_DURATION: Histogram = {
        let opts = HistogramOpts::new(
            "upstream_sync_reconciliation_duration_seconds",
            "Reconciliation cycle duration in seconds",
        );
        let histogram = Histogram::with_opts(opts).expect("Failed to create histogram");
        SYNC_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    /// Reconciliation cycles by result
    static ref RECONCILIATIONS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "upstream_sync_reconciliations_total",
            "Total number of reconciliation cycles",
        );
        let counter = IntCounterVec::new(opts, &["result"]).expect("Failed to create counter");
        SYNC_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Servers in the last written upstream block
    static ref UPSTREAM_MEMBERS: IntGauge = {
        let gauge = IntGauge::new(
            "upstream_sync_upstream_members",
            "Number of servers in the last written upstream block",
        )
        .expect("Failed to create gauge");
        SYNC_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };

    /// Node watch events by type
    static ref NODE_EVENTS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "upstream_sync_node_events_total",
            "Total number of node watch events received",
        );
        let counter = IntCounterVec::new(opts, &["type"]).expect("Failed to create counter");
        SYNC_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Node watch re-subscriptions by reason
    static ref WATCH_RESTARTS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "upstream_sync_watch_restarts_total",
            "Total number of node watch restarts",
        );
        let counter = IntCounterVec::new(opts, &["reason"]).expect("Failed to create counter");
        SYNC_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };
}

/// Record one reconciliation cycle
pub fn record_reconciliation(duration_secs: f64, result: &str) {
    RECONCILIATION_DURATION.observe(duration_secs);
    RECONCILIATIONS_TOTAL.with_label_values(&[result]).inc();
}

/// Record the size of the upstream block just written
pub fn set_upstream_members(count: usize) {
    UPSTREAM_MEMBERS.set(i64::try_from(count).unwrap_or(i64::MAX));
}

/// Record a node watch event
pub fn record_node_event(event_type: &str) {
    NODE_EVENTS_TOTAL.with_label_values(&[event_type]).inc();
}

/// Record a watch restart (`closed`, `error`, `subscribe_failed`)
pub fn record_watch_restart(reason: &str) {
    WATCH_RESTARTS_TOTAL.with_label_values(&[reason]).inc();
}

/// Gather metrics in the Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = SYNC_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}
