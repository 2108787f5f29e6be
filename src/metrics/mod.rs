//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Poll cycles and tracked intents
//! - Execution and failover outcomes
//! - Bridge operations
//! - Emitted lifecycle events

use crate::error::OrchestratorResult;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, Counter, CounterVec, Encoder,
    Gauge, Histogram, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Monitoring lifecycle
    pub static ref MONITORING_ACTIVE: Gauge = prometheus::register_gauge!(
        "failover_monitoring_active",
        "Whether the poll loop is scheduled (1=active, 0=stopped)"
    ).unwrap();

    pub static ref POLL_CYCLES: Counter = prometheus::register_counter!(
        "failover_poll_cycles_total",
        "Total poll cycles run"
    ).unwrap();

    pub static ref TRACKED_INTENTS: Gauge = register_gauge!(
        "failover_tracked_intents",
        "Intents currently tracked by the engine"
    ).unwrap();

    // Intent metrics
    pub static ref INTENTS_DETECTED: Counter = prometheus::register_counter!(
        "failover_intents_detected_total",
        "Total pending intents detected"
    ).unwrap();

    pub static ref EXECUTION_ATTEMPTS: CounterVec = register_counter_vec!(
        "failover_execution_attempts_total",
        "Execution attempts by chain",
        &["chain_id"]
    ).unwrap();

    pub static ref EXECUTION_OUTCOMES: CounterVec = register_counter_vec!(
        "failover_execution_outcomes_total",
        "Execution outcomes by result",
        &["outcome"]
    ).unwrap();

    // Failover metrics
    pub static ref FAILOVER_ATTEMPTS: Counter = prometheus::register_counter!(
        "failover_attempts_total",
        "Total failover sequences started"
    ).unwrap();

    pub static ref FAILOVER_OUTCOMES: CounterVec = register_counter_vec!(
        "failover_outcomes_total",
        "Failover outcomes by result",
        &["outcome"]
    ).unwrap();

    // Bridge metrics
    pub static ref BRIDGES_INITIATED: Counter = prometheus::register_counter!(
        "failover_bridges_initiated_total",
        "Total bridge transfers initiated"
    ).unwrap();

    pub static ref BRIDGES_COMPLETED: Counter = prometheus::register_counter!(
        "failover_bridges_completed_total",
        "Total bridge transfers completed"
    ).unwrap();

    pub static ref BRIDGE_WAIT_SECONDS: Histogram = register_histogram!(
        "failover_bridge_wait_seconds",
        "Time spent waiting for bridge completion",
        vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_EMITTED: CounterVec = register_counter_vec!(
        "failover_events_emitted_total",
        "Lifecycle events emitted by kind",
        &["event"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> OrchestratorResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

// Helper functions to record metrics

pub fn set_monitoring(active: bool) {
    MONITORING_ACTIVE.set(if active { 1.0 } else { 0.0 });
}

pub fn record_poll_cycle() {
    POLL_CYCLES.inc();
}

pub fn set_tracked_intents(count: usize) {
    TRACKED_INTENTS.set(count as f64);
}

pub fn record_intent_detected() {
    INTENTS_DETECTED.inc();
}

pub fn record_execution_attempt(chain_id: u64) {
    EXECUTION_ATTEMPTS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_execution_outcome(outcome: &str) {
    EXECUTION_OUTCOMES.with_label_values(&[outcome]).inc();
}

pub fn record_failover_attempt() {
    FAILOVER_ATTEMPTS.inc();
}

pub fn record_failover_outcome(outcome: &str) {
    FAILOVER_OUTCOMES.with_label_values(&[outcome]).inc();
}

pub fn record_bridge_initiated() {
    BRIDGES_INITIATED.inc();
}

pub fn record_bridge_completed() {
    BRIDGES_COMPLETED.inc();
}

pub fn record_bridge_wait_secs(secs: f64) {
    BRIDGE_WAIT_SECONDS.observe(secs);
}

pub fn record_event(event_name: &str) {
    EVENTS_EMITTED.with_label_values(&[event_name]).inc();
}
