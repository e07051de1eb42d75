//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - State events dispatched, by tag
//! - Failed balance queries, by figure
//! - Transfer outcomes
//! - Pipeline restarts and the active network

use crate::events::StateEvent;
use crate::transfer::TransferDirection;

use anyhow::{Context, Result};
use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, CounterVec, Encoder, Gauge, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    pub static ref STATE_EVENTS: CounterVec = register_counter_vec!(
        "exchange_client_state_events_total",
        "Total state events dispatched by type",
        &["event_type"]
    ).unwrap();

    pub static ref BALANCE_QUERY_FAILURES: CounterVec = register_counter_vec!(
        "exchange_client_balance_query_failures_total",
        "Total failed balance queries by figure",
        &["field"]
    ).unwrap();

    pub static ref TRANSFERS: CounterVec = register_counter_vec!(
        "exchange_client_transfers_total",
        "Total transfers by direction and outcome",
        &["direction", "outcome"]
    ).unwrap();

    pub static ref PIPELINE_RESTARTS: CounterVec = register_counter_vec!(
        "exchange_client_pipeline_restarts_total",
        "Total pipeline restarts by cause",
        &["cause"]
    ).unwrap();

    pub static ref ACTIVE_NETWORK: Gauge = register_gauge!(
        "exchange_client_active_network",
        "Network identifier the agent is on"
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

    pub async fn run(&self) -> Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind metrics server to {}", addr))?;
        axum::serve(listener, app)
            .await
            .context("Metrics server stopped")?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Text exposition of every registered metric
pub fn render() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// Helper functions to record metrics

pub fn record_state_event(event: &StateEvent) {
    STATE_EVENTS.with_label_values(&[event.tag()]).inc();
}

pub fn record_query_failure(field: &str) {
    BALANCE_QUERY_FAILURES.with_label_values(&[field]).inc();
}

pub fn record_transfer(direction: TransferDirection, outcome: &str) {
    TRANSFERS
        .with_label_values(&[direction.as_str(), outcome])
        .inc();
}

pub fn record_pipeline_restart(cause: &str) {
    PIPELINE_RESTARTS.with_label_values(&[cause]).inc();
}

pub fn record_network(chain_id: u64) {
    ACTIVE_NETWORK.set(chain_id as f64);
}
