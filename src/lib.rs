//! Ares mesh relay library.
//!
//! Destination proxying over a mesh transport, with circuit breaking,
//! retries and metric-driven path selection.
//!
//! ```text
//!   client role                          relay-node role
//!   ┌──────────────┐   link    ┌─────────────────────┐   packet   ┌────────┐
//!   │ send_via_    │──────────▶│ validate → pending  │───────────▶│ target │
//!   │ proxy        │◀──────────│ ← forward response  │◀───────────│        │
//!   └──────────────┘           └─────────────────────┘            └────────┘
//!
//!   cross-cutting: config · observability · resilience · path_selection · lifecycle
//! ```

// Core subsystems
pub mod config;
pub mod path_selection;
pub mod relay;
pub mod transport;

// Cross-cutting concerns
pub mod admin;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::AresConfig;
pub use lifecycle::{Ares, Shutdown};
pub use relay::{ProxyRelay, RelayError};
