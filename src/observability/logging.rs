//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once per process
//! - Resolve the effective filter from CLI, environment and config
//! - Re-apply levels at runtime when the configuration reloads
//!
//! # Design Decisions
//! - Precedence: `--log-level` > `RUST_LOG` > `[logging].level`
//! - `[logging].module_levels` entries become `target=level` directives
//! - JSON format for production, pretty format for development

use thiserror::Error;
use tracing_subscriber::filter::{Directive, ParseError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::config::{LogFormat, LoggingConfig};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),

    #[error("logging already initialized: {0}")]
    Init(#[from] TryInitError),

    #[error("failed to reload log filter: {0}")]
    Reload(#[from] reload::Error),
}

/// Handle for changing log levels after startup.
#[derive(Clone)]
pub struct LogHandle {
    inner: reload::Handle<EnvFilter, Registry>,
    cli_level: Option<String>,
}

impl LogHandle {
    /// Rebuild the filter from `config`, keeping any CLI override.
    pub fn apply(&self, config: &LoggingConfig) -> Result<(), LoggingError> {
        let filter = build_filter(config, self.cli_level.as_deref())?;
        self.inner.reload(filter)?;
        tracing::debug!(level = %config.level, "Log filter reloaded");
        Ok(())
    }
}

/// Build the effective filter.
pub fn build_filter(config: &LoggingConfig, cli_level: Option<&str>) -> Result<EnvFilter, LoggingError> {
    let base = match cli_level {
        Some(level) => level.to_string(),
        None => std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| config.level.clone()),
    };

    let mut filter = EnvFilter::try_new(base)?;
    for (target, level) in &config.module_levels {
        let directive: Directive = format!("{target}={}", level.to_ascii_lowercase()).parse()?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

/// Install the global subscriber.
pub fn init_logging(config: &LoggingConfig, cli_level: Option<&str>) -> Result<LogHandle, LoggingError> {
    let filter = build_filter(config, cli_level)?;
    let (filter_layer, handle) = reload::Layer::new(filter);
    let registry = tracing_subscriber::registry().with(filter_layer);

    match config.format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
        LogFormat::Pretty => registry.with(fmt::layer()).try_init()?,
    }

    Ok(LogHandle {
        inner: handle,
        cli_level: cli_level.map(str::to_string),
    })
}
