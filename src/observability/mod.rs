//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All features produce:
//!     → logging.rs (structured events under per-component spans)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - No global logger objects: each component owns a span tagged with its name
//! - Metrics are cheap and a no-op until an exporter is installed

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogHandle, LoggingError};
