//! Path selection subsystem.
//!
//! # Data Flow
//! ```text
//! get_best_path(destination)
//!     → transport.paths_to (candidates, transport order)
//!     → cache.rs (reuse score younger than interval / 2)
//!     → evaluator.rs (rtt probe, hops, link quality, custom)
//!     → minimum score wins
//!
//! periodic_update (main loop tick)
//!     → re-score known destinations once per interval
//! ```

pub mod cache;
pub mod evaluator;
pub mod selector;

pub use cache::{CachedMetric, MetricCache};
pub use evaluator::{EvaluatorError, EvaluatorRegistry, MetricEvaluator, MetricKind};
pub use selector::{PathSelector, SelectedPath, SelectorStatus};
