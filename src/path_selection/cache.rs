//! Per-path metric cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::path_selection::MetricKind;
use crate::transport::PathId;

/// A measured metric value and when it was taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedMetric {
    pub value: f64,
    pub measured_at: Instant,
}

/// A thread-safe cache of path metrics.
///
/// Entries are overwritten on re-measurement and never purged.
#[derive(Clone, Default)]
pub struct MetricCache {
    inner: Arc<DashMap<PathId, HashMap<MetricKind, CachedMetric>>>,
}

impl MetricCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &PathId, kind: MetricKind) -> Option<CachedMetric> {
        self.inner.get(path).and_then(|m| m.get(&kind).copied())
    }

    /// The cached value, if it was measured less than `max_age` ago.
    pub fn fresh(&self, path: &PathId, kind: MetricKind, max_age: Duration) -> Option<f64> {
        self.get(path, kind)
            .filter(|m| m.measured_at.elapsed() < max_age)
            .map(|m| m.value)
    }

    pub fn store(&self, path: PathId, kind: MetricKind, value: f64) {
        self.inner.entry(path).or_default().insert(
            kind,
            CachedMetric {
                value,
                measured_at: Instant::now(),
            },
        );
    }

    /// Number of paths with at least one cached metric.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
