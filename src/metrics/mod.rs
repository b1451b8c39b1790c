//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Transaction decisions and prepare latency
//! - Lock expiry and stale decisions per shard
//! - Channel updates, disputes and settlements

use crate::coordination::Decision;
use crate::error::{CoordinatorError, CoordinatorResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec,
    TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Transaction metrics
    pub static ref TX_BEGUN: CounterVec = register_counter_vec!(
        "tesseract_transactions_begun_total",
        "Total cross-shard transactions begun",
        &[]
    ).unwrap();

    pub static ref TX_DECIDED: CounterVec = register_counter_vec!(
        "tesseract_transactions_decided_total",
        "Total decisions by outcome",
        &["decision"]
    ).unwrap();

    pub static ref TX_PARTIALLY_APPLIED: CounterVec = register_counter_vec!(
        "tesseract_transactions_partially_applied_total",
        "Transactions whose decision could not be delivered to every shard",
        &[]
    ).unwrap();

    pub static ref PREPARE_LATENCY: HistogramVec = register_histogram_vec!(
        "tesseract_prepare_latency_seconds",
        "Time to collect all prepare votes",
        &[],
        vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    // Shard metrics
    pub static ref LOCKS_EXPIRED: CounterVec = register_counter_vec!(
        "tesseract_locks_expired_total",
        "Locks released unilaterally after the max duration",
        &["shard_id"]
    ).unwrap();

    pub static ref STALE_DECISIONS: CounterVec = register_counter_vec!(
        "tesseract_stale_decisions_total",
        "Late decisions rejected after local expiry or abort",
        &["shard_id"]
    ).unwrap();

    // Channel metrics
    pub static ref CHANNEL_UPDATES: CounterVec = register_counter_vec!(
        "tesseract_channel_updates_total",
        "Channel updates by result",
        &["result"]
    ).unwrap();

    pub static ref DISPUTES_OPENED: CounterVec = register_counter_vec!(
        "tesseract_disputes_opened_total",
        "Total unilateral closes that opened a dispute",
        &[]
    ).unwrap();

    pub static ref CHANNELS_SETTLED: CounterVec = register_counter_vec!(
        "tesseract_channels_settled_total",
        "Total channel settlements by path",
        &["path"]
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

    pub async fn run(&self) -> CoordinatorResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| CoordinatorError::Config(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| CoordinatorError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_transaction_begun() {
    TX_BEGUN.with_label_values(&[]).inc();
}

pub fn record_decision(decision: Decision) {
    TX_DECIDED.with_label_values(&[decision.as_str()]).inc();
}

pub fn record_partially_applied() {
    TX_PARTIALLY_APPLIED.with_label_values(&[]).inc();
}

pub fn record_prepare_latency(latency_secs: f64) {
    PREPARE_LATENCY.with_label_values(&[]).observe(latency_secs);
}

pub fn record_lock_expired(shard_id: u64) {
    LOCKS_EXPIRED
        .with_label_values(&[&shard_id.to_string()])
        .inc();
}

pub fn record_stale_decision(shard_id: u64) {
    STALE_DECISIONS
        .with_label_values(&[&shard_id.to_string()])
        .inc();
}

pub fn record_channel_update(result: &str) {
    CHANNEL_UPDATES.with_label_values(&[result]).inc();
}

pub fn record_dispute_opened() {
    DISPUTES_OPENED.with_label_values(&[]).inc();
}

pub fn record_channel_settled(path: &str) {
    CHANNELS_SETTLED.with_label_values(&[path]).inc();
}
