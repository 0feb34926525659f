//! Prometheus-based metrics module
//!
//! Global traffic counters fed by the statistics manager, exposed via the
//! /metrics endpoint.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total bytes uploaded through tracked flows
    pub static ref TRAFFIC_UPLOAD_BYTES: IntCounter = IntCounter::new(
        "strait_traffic_upload_bytes_total",
        "Total bytes uploaded through tracked flows"
    ).unwrap();

    /// Total bytes downloaded through tracked flows
    pub static ref TRAFFIC_DOWNLOAD_BYTES: IntCounter = IntCounter::new(
        "strait_traffic_download_bytes_total",
        "Total bytes downloaded through tracked flows"
    ).unwrap();

    /// Currently tracked flows
    pub static ref FLOWS_ACTIVE: IntGauge = IntGauge::new(
        "strait_flows_active",
        "Number of currently tracked flows"
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(TRAFFIC_UPLOAD_BYTES.clone())).ok();
    REGISTRY.register(Box::new(TRAFFIC_DOWNLOAD_BYTES.clone())).ok();
    REGISTRY.register(Box::new(FLOWS_ACTIVE.clone())).ok();
}
