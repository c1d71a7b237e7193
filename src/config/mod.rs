//! Daemon configuration: schema, loading, validation and hot reload.
//!
//! # Data Flow
//! ```text
//! ares.toml / ares.json
//!     → loader.rs picks the format from the extension and deserializes
//!     → validation.rs collects every semantic problem at once
//!     → AresConfig snapshot handed to Ares
//!
//! SIGHUP or a file change:
//!     watcher.rs reloads the file through the same path
//!     → Ares::apply_config swaps the snapshot and updates features
//! ```
//!
//! # Design Decisions
//! - Every section defaults, so an empty file is a valid config
//! - A snapshot is never mutated; reload replaces it whole
//! - A reload that fails to load or validate keeps the running configuration

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AdminConfig, AresConfig, CircuitBreakerConfig, CoreConfig, LogFormat, LoggingConfig,
    MonitoringConfig, PathSelectionConfig, ProxyRouteConfig, ProxyingConfig, RetryConfig,
    TransportKind,
};
