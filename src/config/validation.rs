//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds and intervals > 0, delays >= 0)
//! - Check addresses parse and log levels are known
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AresConfig → Result<(), Vec<ValidationError>>
//! - Proxy route entries are left to the relay, which drops malformed ones

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::AresConfig;
use crate::path_selection::MetricKind;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// A single semantic problem, tagged with the dotted field path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Default)]
struct Collector(Vec<ValidationError>);

impl Collector {
    fn check(&mut self, ok: bool, field: &str, message: &str) {
        if !ok {
            self.0.push(ValidationError::new(field, message));
        }
    }

    fn positive(&mut self, value: f64, field: &str) {
        self.check(value.is_finite() && value > 0.0, field, "must be a positive number");
    }

    fn non_negative(&mut self, value: f64, field: &str) {
        self.check(value.is_finite() && value >= 0.0, field, "must be zero or greater");
    }

    fn address(&mut self, value: &str, field: &str) {
        if value.parse::<SocketAddr>().is_err() {
            self.0.push(ValidationError::new(
                field,
                format!("{value:?} is not a socket address"),
            ));
        }
    }

    fn level(&mut self, value: &str, field: &str) {
        if !LOG_LEVELS.contains(&value.to_ascii_lowercase().as_str()) {
            self.0.push(ValidationError::new(
                field,
                format!("unknown log level {value:?}"),
            ));
        }
    }
}

/// Check every semantic rule and return all violations.
pub fn validate_config(config: &AresConfig) -> Result<(), Vec<ValidationError>> {
    let mut c = Collector::default();

    c.level(&config.logging.level, "logging.level");
    for (target, level) in &config.logging.module_levels {
        c.check(!target.is_empty(), "logging.module_levels", "target must not be empty");
        c.level(level, &format!("logging.module_levels.{target}"));
    }

    c.check(
        config.core.main_loop_interval_secs > 0,
        "core.main_loop_interval_secs",
        "must be greater than zero",
    );

    if config.monitoring.enabled {
        c.address(&config.monitoring.metrics_address, "monitoring.metrics_address");
        c.check(
            !config.monitoring.metrics_prefix.is_empty(),
            "monitoring.metrics_prefix",
            "must not be empty",
        );
    }

    if config.admin.enabled {
        c.address(&config.admin.bind_address, "admin.bind_address");
    }

    let breaker = &config.circuit_breaker;
    c.check(
        breaker.failure_threshold > 0,
        "circuit_breaker.failure_threshold",
        "must be greater than zero",
    );
    c.non_negative(
        breaker.recovery_timeout_seconds,
        "circuit_breaker.recovery_timeout_seconds",
    );

    let retries = &config.request_retries;
    c.non_negative(retries.default_delay_seconds, "request_retries.default_delay_seconds");
    c.non_negative(
        retries.default_jitter_max_seconds,
        "request_retries.default_jitter_max_seconds",
    );
    c.check(
        retries.default_backoff_factor.is_finite() && retries.default_backoff_factor >= 1.0,
        "request_retries.default_backoff_factor",
        "must be at least 1.0",
    );

    let paths = &config.path_selection;
    c.positive(
        paths.metric_update_interval_seconds,
        "path_selection.metric_update_interval_seconds",
    );
    c.positive(paths.rtt_probe_timeout_seconds, "path_selection.rtt_probe_timeout_seconds");
    c.check(
        paths.max_paths_to_consider > 0,
        "path_selection.max_paths_to_consider",
        "must be greater than zero",
    );
    if paths.default_metric == MetricKind::Custom {
        c.check(
            paths
                .custom_metrics_module
                .as_deref()
                .is_some_and(|m| !m.is_empty()),
            "path_selection.custom_metrics_module",
            "required when default_metric is \"custom\"",
        );
    }

    let proxying = &config.destination_proxying;
    c.check(
        !proxying.listen_on_aspect.is_empty() && !proxying.listen_on_aspect.contains('.'),
        "destination_proxying.listen_on_aspect",
        "must be a single non-empty name component",
    );
    c.check(
        !proxying.proxy_protocol_version.is_empty(),
        "destination_proxying.proxy_protocol_version",
        "must not be empty",
    );

    if c.0.is_empty() {
        Ok(())
    } else {
        Err(c.0)
    }
}
