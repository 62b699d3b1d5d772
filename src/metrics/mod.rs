//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Transaction submissions and outcomes
//! - Sequence conflicts and resyncs
//! - Poll latency
//! - Contract deployments

use crate::error::HarnessResult;
use crate::tx::TransactionOutcome;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};
use std::future::Future;
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Transaction metrics
    pub static ref TX_SUBMITTED: Counter = register_counter!(
        "ledger_harness_transactions_submitted_total",
        "Total transactions accepted by the ledger"
    ).unwrap();

    pub static ref TX_OUTCOMES: CounterVec = register_counter_vec!(
        "ledger_harness_transaction_outcomes_total",
        "Transaction outcomes by kind",
        &["outcome"]
    ).unwrap();

    pub static ref POLL_LATENCY: Histogram = register_histogram!(
        "ledger_harness_poll_latency_seconds",
        "Time from first status check to outcome",
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    // Sequence metrics
    pub static ref SEQUENCE_CONFLICTS: Counter = register_counter!(
        "ledger_harness_sequence_conflicts_total",
        "Submissions rejected for a stale or duplicate sequence number"
    ).unwrap();

    pub static ref SEQUENCE_RESYNCS: Counter = register_counter!(
        "ledger_harness_sequence_resyncs_total",
        "Sequence counters re-read from the ledger"
    ).unwrap();

    // Deployment metrics
    pub static ref CONTRACTS_DEPLOYED: Counter = register_counter!(
        "ledger_harness_contracts_deployed_total",
        "Contracts deployed"
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

    /// Serve `/metrics` until `shutdown` completes
    pub async fn run<F>(&self, shutdown: F) -> HarnessResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))
}

/// Current metrics in the text exposition format
pub fn render() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}

// Helper functions to record metrics

pub fn record_tx_submitted() {
    TX_SUBMITTED.inc();
}

pub fn record_tx_outcome(outcome: &TransactionOutcome) {
    TX_OUTCOMES.with_label_values(&[outcome.label()]).inc();
}

pub fn record_poll_latency(latency_secs: f64) {
    POLL_LATENCY.observe(latency_secs);
}

pub fn record_sequence_conflict() {
    SEQUENCE_CONFLICTS.inc();
}

pub fn record_sequence_resync() {
    SEQUENCE_RESYNCS.inc();
}

pub fn record_contract_deployed() {
    CONTRACTS_DEPLOYED.inc();
}
