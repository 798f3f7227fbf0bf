//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Queue depth and backpressure
//! - Account pool utilisation
//! - Submission outcomes and retries
//! - Confirmation latency

use crate::error::{RelayerError, RelayerResult};

use axum::{http::StatusCode, routing::get, Router};
use ethers::types::Address;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, CounterVec, Encoder, Gauge,
    Histogram, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Queue metrics
    pub static ref QUEUE_DEPTH: Gauge = register_gauge!(
        "relayer_queue_depth",
        "Requests waiting for an account"
    ).unwrap();

    pub static ref BACKPRESSURE: CounterVec = register_counter_vec!(
        "relayer_backpressure_total",
        "Submissions refused because the queue was full",
        &[]
    ).unwrap();

    // Account metrics
    pub static ref ACCOUNTS_BUSY: Gauge = register_gauge!(
        "relayer_accounts_busy",
        "Accounts currently bound to an in-flight transaction"
    ).unwrap();

    pub static ref ACCOUNTS_DISABLED: CounterVec = register_counter_vec!(
        "relayer_accounts_disabled_total",
        "Accounts withdrawn after repeated failures",
        &["account"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "relayer_transactions_submitted_total",
        "Total transactions submitted",
        &["account"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "relayer_transactions_confirmed_total",
        "Total transactions confirmed",
        &["account"]
    ).unwrap();

    pub static ref TX_RETRIED: CounterVec = register_counter_vec!(
        "relayer_transactions_retried_total",
        "Total retries scheduled by failure reason",
        &["reason"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "relayer_transactions_failed_total",
        "Total transactions failed permanently by reason",
        &["reason"]
    ).unwrap();

    pub static ref TX_IN_FLIGHT: Gauge = register_gauge!(
        "relayer_transactions_in_flight",
        "Submitted transactions awaiting confirmation"
    ).unwrap();

    pub static ref TX_LATENCY: Histogram = register_histogram!(
        "relayer_confirmation_latency_seconds",
        "Time from submission to confirmation",
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
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

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Config(format!("Cannot bind metrics port {}: {}", self.port, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Encode the default registry in the text exposition format
pub fn render() -> RelayerResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| RelayerError::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| RelayerError::Internal(e.to_string()))
}

fn account_label(account: &Address) -> String {
    format!("{:?}", account)
}

// Helper functions to record metrics

pub fn record_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(depth as f64);
}

pub fn record_backpressure() {
    BACKPRESSURE.with_label_values(&[]).inc();
}

pub fn record_accounts_busy(busy: usize) {
    ACCOUNTS_BUSY.set(busy as f64);
}

pub fn record_account_disabled(account: &Address) {
    ACCOUNTS_DISABLED
        .with_label_values(&[&account_label(account)])
        .inc();
}

pub fn record_tx_submitted(account: &Address) {
    TX_SUBMITTED
        .with_label_values(&[&account_label(account)])
        .inc();
}

pub fn record_tx_confirmed(account: &Address, latency_secs: f64) {
    TX_CONFIRMED
        .with_label_values(&[&account_label(account)])
        .inc();
    TX_LATENCY.observe(latency_secs);
}

pub fn record_tx_retried(reason: &str) {
    TX_RETRIED.with_label_values(&[reason]).inc();
}

pub fn record_tx_failed(reason: &str) {
    TX_FAILED.with_label_values(&[reason]).inc();
}

pub fn record_in_flight(count: usize) {
    TX_IN_FLIGHT.set(count as f64);
}
