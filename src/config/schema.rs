//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the daemon.
//! All types derive Serde traits for deserialization from config files, and
//! every section falls back to its defaults when absent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::path_selection::MetricKind;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct AresConfig {
    /// Log level, format and per-module overrides.
    pub logging: LoggingConfig,

    /// Main loop and transport binding.
    pub core: CoreConfig,

    /// Prometheus exporter.
    pub monitoring: MonitoringConfig,

    /// HTTP status endpoint.
    pub admin: AdminConfig,

    /// Defaults for every named circuit breaker.
    pub circuit_breaker: CircuitBreakerConfig,

    pub request_retries: RetryConfig,

    pub path_selection: PathSelectionConfig,

    pub destination_proxying: ProxyingConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level (trace, debug, info, warn, error).
    pub level: String,

    pub format: LogFormat,

    /// Per-target levels, e.g. `"ares_relay::relay" = "debug"`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            module_levels: BTreeMap::new(),
        }
    }
}

/// Which mesh transport the daemon binds.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process loopback mesh.
    #[default]
    Loopback,
    /// No transport; transport-requiring operations fail.
    #[serde(rename = "none")]
    Disabled,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    /// Seconds between periodic feature updates.
    pub main_loop_interval_secs: u64,

    pub transport: TransportKind,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            main_loop_interval_secs: 30,
            transport: TransportKind::Loopback,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,

    /// Prometheus scrape address.
    pub metrics_address: String,

    /// Prefix of every metric name.
    pub metrics_prefix: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_address: "0.0.0.0:9876".to_string(),
            metrics_prefix: "ares".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,

    pub bind_address: String,

    /// Bearer key required on every request when set.
    pub api_key: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "127.0.0.1:8787".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Seconds after the last failure before a trial call is admitted.
    pub recovery_timeout_seconds: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_seconds: 30.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,

    pub default_max_retries: u32,

    pub default_delay_seconds: f64,

    pub default_backoff_factor: f64,

    /// Upper bound of the symmetric random offset added to each delay.
    pub default_jitter_max_seconds: f64,

    /// Log every retried attempt at warn level.
    pub log_retries: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_max_retries: 3,
            default_delay_seconds: 1.0,
            default_backoff_factor: 2.0,
            default_jitter_max_seconds: 0.5,
            log_retries: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PathSelectionConfig {
    pub enabled: bool,

    pub default_metric: MetricKind,

    pub metric_update_interval_seconds: f64,

    pub rtt_probe_timeout_seconds: f64,

    pub max_paths_to_consider: usize,

    /// Name of a registered evaluator used by the `custom` metric.
    pub custom_metrics_module: Option<String>,
}

impl Default for PathSelectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_metric: MetricKind::Rtt,
            metric_update_interval_seconds: 60.0,
            rtt_probe_timeout_seconds: 5.0,
            max_paths_to_consider: 5,
            custom_metrics_module: None,
        }
    }
}

/// One client-side route. Fields are optional so incomplete entries load
/// and are dropped by the relay instead of failing the whole file.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyRouteConfig {
    pub alias: Option<String>,

    /// Dotted endpoint name on the exit node, e.g. `ares.proxy.default_proxy_service`.
    pub entry_destination_name: Option<String>,

    /// Identity hash of the exit node (32 lowercase hex characters).
    pub exit_node_identity_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProxyingConfig {
    pub enabled: bool,

    /// Relay-node role when true, client role otherwise.
    pub is_proxy_node: bool,

    pub proxy_routes: Vec<ProxyRouteConfig>,

    /// Aspect of the listening endpoint in relay-node role.
    pub listen_on_aspect: String,

    pub proxy_protocol_version: String,
}

impl Default for ProxyingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            is_proxy_node: false,
            proxy_routes: Vec::new(),
            listen_on_aspect: "default_proxy_service".to_string(),
            proxy_protocol_version: "1.0".to_string(),
        }
    }
}
