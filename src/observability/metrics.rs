//! Metrics sink and Prometheus exposition.
//!
//! # Responsibilities
//! - Install the Prometheus exporter when monitoring is enabled
//! - Name every metric with the configured prefix
//! - Provide one `record_*` / `set_*` function per reported fact
//!
//! # Metrics
//! - `{p}_retry_executions_total`, `{p}_retry_successes_total`,
//!   `{p}_retry_successes_on_retry_total`, `{p}_retry_failures_total` (counters, by operation)
//! - `{p}_retry_operation_duration_seconds`, `{p}_retry_attempts` (histograms, by operation)
//! - `{p}_proxied_packets_total` (counter, by alias and direction)
//! - `{p}_active_proxy_routes_count`, `{p}_active_proxy_clients_count` (gauges)
//! - `{p}_path_selection_evaluations_total` (counter)
//! - `{p}_path_selection_chosen_metric_value` (gauge, by destination and metric; inf → -1)
//! - `{p}_circuit_breaker_state` (gauge, by breaker; 0 closed, 1 open, 2 half-open)
//! - `{p}_active_features_count`, `{p}_info` (gauges)
//!
//! # Design Decisions
//! - Without an installed recorder every call is a no-op, so components report
//!   unconditionally
//! - The prefix is fixed at first install; later prefix changes need a restart

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

const DEFAULT_PREFIX: &str = "ares";

static PREFIX: OnceLock<String> = OnceLock::new();

/// Direction label of `proxied_packets_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    SentToProxy,
    SentToTarget,
    ResponseToClient,
    ErrorToClient,
}

impl PacketDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketDirection::SentToProxy => "sent_to_proxy",
            PacketDirection::SentToTarget => "sent_to_target",
            PacketDirection::ResponseToClient => "response_to_client",
            PacketDirection::ErrorToClient => "error_to_client",
        }
    }
}

/// Fix the metric name prefix. Only the first call has an effect.
pub fn set_prefix(prefix: &str) {
    if PREFIX.set(prefix.to_string()).is_err() && PREFIX.get().map(String::as_str) != Some(prefix) {
        tracing::warn!(prefix, "Metrics prefix already set; restart to change it");
    }
}

fn name(suffix: &str) -> String {
    let prefix = PREFIX.get().map(String::as_str).unwrap_or(DEFAULT_PREFIX);
    format!("{prefix}_{suffix}")
}

/// Install the Prometheus recorder and its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr, prefix: &str) -> Result<(), BuildError> {
    set_prefix(prefix);
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    record_info(env!("CARGO_PKG_VERSION"));
    tracing::info!(address = %addr, prefix, "Prometheus exporter listening");
    Ok(())
}

pub fn record_info(version: &str) {
    metrics::gauge!(name("info"), "version" => version.to_string()).set(1.0);
}

pub fn set_active_features(count: usize) {
    metrics::gauge!(name("active_features_count")).set(count as f64);
}

/// Terminal outcome of one retry-wrapped execution.
pub fn record_retry_outcome(
    operation: &str,
    success: bool,
    attempts: u32,
    elapsed: Duration,
) {
    let op = operation.to_string();
    metrics::counter!(name("retry_executions_total"), "operation_name" => op.clone()).increment(1);
    if success {
        metrics::counter!(name("retry_successes_total"), "operation_name" => op.clone()).increment(1);
        if attempts > 1 {
            metrics::counter!(name("retry_successes_on_retry_total"), "operation_name" => op.clone())
                .increment(1);
        }
    } else {
        metrics::counter!(name("retry_failures_total"), "operation_name" => op.clone()).increment(1);
    }
    metrics::histogram!(name("retry_operation_duration_seconds"), "operation_name" => op.clone())
        .record(elapsed.as_secs_f64());
    metrics::histogram!(name("retry_attempts"), "operation_name" => op).record(f64::from(attempts));
}

pub fn record_proxied_packet(alias: &str, direction: PacketDirection) {
    metrics::counter!(
        name("proxied_packets_total"),
        "proxy_alias" => alias.to_string(),
        "direction" => direction.as_str()
    )
    .increment(1);
}

pub fn set_active_proxy_routes(count: usize) {
    metrics::gauge!(name("active_proxy_routes_count")).set(count as f64);
}

pub fn set_active_proxy_clients(count: usize) {
    metrics::gauge!(name("active_proxy_clients_count")).set(count as f64);
}

pub fn record_path_selection(destination: &str, metric_type: &str, chosen_value: f64) {
    metrics::counter!(name("path_selection_evaluations_total")).increment(1);
    let reported = if chosen_value.is_finite() { chosen_value } else { -1.0 };
    metrics::gauge!(
        name("path_selection_chosen_metric_value"),
        "destination_hash" => destination.to_string(),
        "metric_type" => metric_type.to_string()
    )
    .set(reported);
}

pub fn record_breaker_state(breaker: &str, state: u8) {
    metrics::gauge!(name("circuit_breaker_state"), "name" => breaker.to_string()).set(f64::from(state));
}
