//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Build transport → Enable features → Main loop
//!
//! Main loop:
//!     tick → path re-scoring, relay housekeeping
//!     config update (file watcher / SIGHUP) → apply_config
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop main loop → Shut features down → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     SIGHUP → Trigger config reload
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then logging, then features
//! - A feature that fails to start is logged and left disabled
//! - Second interrupt forces exit

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::{spawn_signal_handler, SignalEvent};
pub use startup::{build_transport, Ares, AresStatus, RequestError};
