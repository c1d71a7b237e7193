//! Metric kinds and pluggable evaluators.
//!
//! Custom metrics are resolved by name from an [`EvaluatorRegistry`] that the
//! embedding application fills at startup; nothing is loaded dynamically.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::{AddressHash, PathInfo};

/// What a path is scored by. Lower is always better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Probe-measured round trip time in seconds.
    #[default]
    Rtt,
    /// Topology-reported hop count.
    Hops,
    /// Topology-reported link cost.
    LinkQuality,
    /// Delegated to the configured evaluator.
    Custom,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Rtt => "rtt",
            MetricKind::Hops => "hops",
            MetricKind::LinkQuality => "link_quality",
            MetricKind::Custom => "custom",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("metric evaluation failed: {0}")]
pub struct EvaluatorError(pub String);

/// Scores one candidate path for the `custom` metric.
pub trait MetricEvaluator: Send + Sync {
    fn evaluate(&self, destination: &AddressHash, path: &PathInfo) -> Result<f64, EvaluatorError>;
}

impl<F> MetricEvaluator for F
where
    F: Fn(&AddressHash, &PathInfo) -> Result<f64, EvaluatorError> + Send + Sync,
{
    fn evaluate(&self, destination: &AddressHash, path: &PathInfo) -> Result<f64, EvaluatorError> {
        self(destination, path)
    }
}

/// Named evaluators available to `custom_metrics_module`.
#[derive(Clone, Default)]
pub struct EvaluatorRegistry {
    evaluators: Arc<DashMap<String, Arc<dyn MetricEvaluator>>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the evaluator known as `name`.
    pub fn register(&self, name: impl Into<String>, evaluator: Arc<dyn MetricEvaluator>) {
        let name = name.into();
        tracing::debug!(evaluator = %name, "Metric evaluator registered");
        self.evaluators.insert(name, evaluator);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MetricEvaluator>> {
        self.evaluators.get(name).map(|e| e.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.evaluators.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl fmt::Debug for EvaluatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluatorRegistry")
            .field("names", &self.names())
            .finish()
    }
}
