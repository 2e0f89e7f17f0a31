//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Polling task outcomes and tick latency
//! - Retries and stage transitions
//! - Multisig actions and expiry sweeps
//! - Chain connectivity and submissions

use crate::error::{OrchestratorError, OrchestratorResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Polling metrics
    pub static ref TASKS_ENQUEUED: CounterVec = register_counter_vec!(
        "zkpay_polling_tasks_enqueued_total",
        "Total polling tasks created by task type",
        &["task_type"]
    ).unwrap();

    pub static ref POLL_OUTCOMES: CounterVec = register_counter_vec!(
        "zkpay_polling_outcomes_total",
        "Polling task evaluations by task type and outcome",
        &["task_type", "outcome"]
    ).unwrap();

    pub static ref POLL_QUERY_ERRORS: CounterVec = register_counter_vec!(
        "zkpay_polling_query_errors_total",
        "Chain query failures while polling, by task type",
        &["task_type"]
    ).unwrap();

    pub static ref TICK_LATENCY: HistogramVec = register_histogram_vec!(
        "zkpay_polling_tick_seconds",
        "Time spent processing one scheduler tick",
        &[],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    pub static ref TASKS_CLAIMED: CounterVec = register_counter_vec!(
        "zkpay_polling_tasks_claimed_total",
        "Total due tasks claimed by scheduler ticks",
        &[]
    ).unwrap();

    // Retry metrics
    pub static ref RETRIES: CounterVec = register_counter_vec!(
        "zkpay_retries_total",
        "Retry requests by entity type and outcome",
        &["entity_type", "outcome"]
    ).unwrap();

    pub static ref STAGE_TRANSITIONS: CounterVec = register_counter_vec!(
        "zkpay_stage_transitions_total",
        "Entity stage transitions by stage and resulting status",
        &["stage", "status"]
    ).unwrap();

    // Multisig metrics
    pub static ref MULTISIG_ACTIONS: CounterVec = register_counter_vec!(
        "zkpay_multisig_actions_total",
        "Multisig proposal actions by kind",
        &["action"]
    ).unwrap();

    pub static ref PROPOSALS_EXPIRED: CounterVec = register_counter_vec!(
        "zkpay_multisig_proposals_expired_total",
        "Proposals moved to expired by the sweep",
        &[]
    ).unwrap();

    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "zkpay_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "zkpay_transactions_submitted_total",
        "Total transactions submitted by chain and call",
        &["chain_id", "call"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECKS: CounterVec = register_counter_vec!(
        "zkpay_health_checks_total",
        "Health checks by result",
        &["result"]
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

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| OrchestratorError::Internal(format!("metrics bind failed: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| OrchestratorError::Internal(format!("metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// Helper functions to record metrics

pub fn record_task_enqueued(task_type: &str) {
    TASKS_ENQUEUED.with_label_values(&[task_type]).inc();
}

pub fn record_poll_outcome(task_type: &str, outcome: &str) {
    POLL_OUTCOMES.with_label_values(&[task_type, outcome]).inc();
}

pub fn record_query_error(task_type: &str) {
    POLL_QUERY_ERRORS.with_label_values(&[task_type]).inc();
}

pub fn record_tick(latency_secs: f64, claimed: usize) {
    TICK_LATENCY.with_label_values(&[]).observe(latency_secs);
    TASKS_CLAIMED.with_label_values(&[]).inc_by(claimed as f64);
}

pub fn record_retry(entity_type: &str, outcome: &str) {
    RETRIES.with_label_values(&[entity_type, outcome]).inc();
}

pub fn record_stage_transition(stage: &str, status: &str) {
    STAGE_TRANSITIONS.with_label_values(&[stage, status]).inc();
}

pub fn record_multisig_action(action: &str) {
    MULTISIG_ACTIONS.with_label_values(&[action]).inc();
}

pub fn record_proposals_expired(count: usize) {
    PROPOSALS_EXPIRED.with_label_values(&[]).inc_by(count as f64);
}

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_tx_submitted(chain_id: u64, call: &str) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string(), call])
        .inc();
}

pub fn record_health_check(healthy: bool) {
    let result = if healthy { "success" } else { "failure" };
    HEALTH_CHECKS.with_label_values(&[result]).inc();
}
