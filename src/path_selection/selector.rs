//! Lowest-cost path selection.
//!
//! # Responsibilities
//! - Ask the transport for candidate paths to a destination
//! - Score the first `max_paths_to_consider` candidates by the configured metric
//! - Reuse a cached score while it is younger than half the update interval
//! - Refresh scores of every known destination on the periodic tick
//!
//! # Design Decisions
//! - Candidates keep transport order; the first minimum wins ties
//! - Any metric that cannot be computed scores `+inf`
//! - Cache and known-path maps are concurrent maps; no guard is held across a probe

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::Span;

use crate::config::PathSelectionConfig;
use crate::observability::metrics;
use crate::path_selection::cache::MetricCache;
use crate::path_selection::evaluator::{EvaluatorRegistry, MetricKind};
use crate::resilience::{duration_from_secs, with_deadline};
use crate::transport::{AddressHash, MeshTransport, PathInfo};

#[derive(Debug, Clone)]
struct SelectorSettings {
    metric: MetricKind,
    update_interval: Duration,
    probe_timeout: Duration,
    max_paths: usize,
    custom_evaluator: Option<String>,
}

impl From<&PathSelectionConfig> for SelectorSettings {
    fn from(config: &PathSelectionConfig) -> Self {
        Self {
            metric: config.default_metric,
            update_interval: duration_from_secs(config.metric_update_interval_seconds),
            probe_timeout: duration_from_secs(config.rtt_probe_timeout_seconds),
            max_paths: config.max_paths_to_consider,
            custom_evaluator: config.custom_metrics_module.clone(),
        }
    }
}

/// The chosen path and its score.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedPath {
    pub path: PathInfo,
    pub metric: MetricKind,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectorStatus {
    pub metric: MetricKind,
    pub known_destinations: usize,
    pub cached_paths: usize,
}

pub struct PathSelector {
    transport: Option<Arc<dyn MeshTransport>>,
    evaluators: EvaluatorRegistry,
    settings: ArcSwap<SelectorSettings>,
    cache: MetricCache,
    known_paths: DashMap<AddressHash, Vec<PathInfo>>,
    last_update: Mutex<Option<Instant>>,
    span: Span,
}

impl PathSelector {
    pub fn new(
        config: &PathSelectionConfig,
        transport: Option<Arc<dyn MeshTransport>>,
        evaluators: EvaluatorRegistry,
    ) -> Self {
        let selector = Self {
            transport,
            evaluators,
            settings: ArcSwap::from_pointee(SelectorSettings::from(config)),
            cache: MetricCache::new(),
            known_paths: DashMap::new(),
            last_update: Mutex::new(None),
            span: tracing::info_span!("path_selector"),
        };
        selector.log_settings();
        selector
    }

    pub fn update_config(&self, config: &PathSelectionConfig) {
        self.settings.store(Arc::new(SelectorSettings::from(config)));
        self.log_settings();
    }

    fn log_settings(&self) {
        let settings = self.settings.load();
        tracing::info!(
            parent: &self.span,
            metric = %settings.metric,
            update_interval_secs = settings.update_interval.as_secs_f64(),
            max_paths = settings.max_paths,
            "Path selection configured"
        );
        if settings.metric == MetricKind::Custom {
            match settings.custom_evaluator.as_deref() {
                Some(name) if self.evaluators.get(name).is_some() => {
                    tracing::info!(parent: &self.span, evaluator = name, "Custom metric evaluator bound");
                }
                name => {
                    tracing::error!(
                        parent: &self.span,
                        evaluator = ?name,
                        available = ?self.evaluators.names(),
                        "Custom metric evaluator not registered; paths will score +inf"
                    );
                }
            }
        }
    }

    pub fn cache(&self) -> &MetricCache {
        &self.cache
    }

    pub fn status(&self) -> SelectorStatus {
        SelectorStatus {
            metric: self.settings.load().metric,
            known_destinations: self.known_paths.len(),
            cached_paths: self.cache.len(),
        }
    }

    /// Pick the lowest-scoring candidate path to `destination`.
    pub async fn get_best_path(&self, destination: &AddressHash) -> Option<SelectedPath> {
        let Some(transport) = self.transport.as_ref() else {
            tracing::warn!(parent: &self.span, "Path selection needs a transport");
            return None;
        };

        let candidates = transport.paths_to(destination);
        if candidates.is_empty() {
            tracing::debug!(parent: &self.span, destination = %destination.short(), "No paths known");
            return None;
        }
        self.known_paths.insert(*destination, candidates.clone());

        let settings = self.settings.load_full();
        let mut best: Option<(PathInfo, f64)> = None;
        for path in candidates.into_iter().take(settings.max_paths) {
            let value = self.metric_for(&settings, destination, &path).await;
            tracing::debug!(
                parent: &self.span,
                destination = %destination.short(),
                path = %path.id,
                metric = %settings.metric,
                value,
                "Path scored"
            );
            if best.as_ref().map_or(true, |(_, current)| value < *current) {
                best = Some((path, value));
            }
        }

        let (path, value) = best?;
        tracing::info!(
            parent: &self.span,
            destination = %destination.short(),
            path = %path.id,
            metric = %settings.metric,
            value,
            "Best path selected"
        );
        metrics::record_path_selection(&destination.to_hex(), settings.metric.as_str(), value);
        Some(SelectedPath {
            path,
            metric: settings.metric,
            value,
        })
    }

    /// Re-score every known destination once per update interval.
    pub async fn periodic_update(&self) {
        let settings = self.settings.load_full();
        {
            let mut last = self.last_update.lock().expect("path selector mutex poisoned");
            if last.is_some_and(|at| at.elapsed() < settings.update_interval) {
                return;
            }
            *last = Some(Instant::now());
        }

        let known: Vec<(AddressHash, Vec<PathInfo>)> = self
            .known_paths
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        tracing::info!(parent: &self.span, destinations = known.len(), "Refreshing path metrics");

        for (destination, paths) in known {
            for path in paths.iter().take(settings.max_paths) {
                self.metric_for(&settings, &destination, path).await;
            }
        }
    }

    async fn metric_for(&self, settings: &SelectorSettings, destination: &AddressHash, path: &PathInfo) -> f64 {
        let max_age = settings.update_interval / 2;
        if let Some(value) = self.cache.fresh(&path.id, settings.metric, max_age) {
            return value;
        }

        let value = match settings.metric {
            MetricKind::Rtt => self.measure_rtt(settings.probe_timeout, path).await,
            MetricKind::Hops => path.hops.map_or(f64::INFINITY, f64::from),
            MetricKind::LinkQuality => path.quality.unwrap_or(f64::INFINITY),
            MetricKind::Custom => self.evaluate_custom(settings, destination, path),
        };
        let value = if value.is_nan() { f64::INFINITY } else { value };

        self.cache.store(path.id.clone(), settings.metric, value);
        value
    }

    async fn measure_rtt(&self, timeout: Duration, path: &PathInfo) -> f64 {
        let Some(transport) = self.transport.as_ref() else {
            return f64::INFINITY;
        };
        match with_deadline("rtt probe", timeout, transport.probe_rtt(path, timeout)).await {
            Ok(Some(rtt)) => rtt.as_secs_f64(),
            Ok(None) | Err(_) => {
                tracing::debug!(parent: &self.span, path = %path.id, "RTT probe failed");
                f64::INFINITY
            }
        }
    }

    fn evaluate_custom(&self, settings: &SelectorSettings, destination: &AddressHash, path: &PathInfo) -> f64 {
        let Some(evaluator) = settings
            .custom_evaluator
            .as_deref()
            .and_then(|name| self.evaluators.get(name))
        else {
            return f64::INFINITY;
        };
        // A panicking evaluator scores like a failing one.
        match panic::catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(destination, path))) {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                tracing::error!(parent: &self.span, path = %path.id, error = %e, "Custom metric failed");
                f64::INFINITY
            }
            Err(_) => {
                tracing::error!(parent: &self.span, path = %path.id, "Custom metric evaluator panicked");
                f64::INFINITY
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_selection::EvaluatorError;
    use crate::transport::memory::MemoryMesh;

    fn config(metric: MetricKind) -> PathSelectionConfig {
        PathSelectionConfig {
            enabled: true,
            default_metric: metric,
            metric_update_interval_seconds: 60.0,
            rtt_probe_timeout_seconds: 1.0,
            max_paths_to_consider: 5,
            custom_metrics_module: None,
        }
    }

    fn selector(mesh: &MemoryMesh, config: &PathSelectionConfig) -> PathSelector {
        PathSelector::new(config, Some(Arc::new(mesh.node())), EvaluatorRegistry::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_picks_lowest_rtt() {
        let mesh = MemoryMesh::new();
        let dest = AddressHash::random();
        mesh.set_paths(dest, vec![PathInfo::new("a"), PathInfo::new("b"), PathInfo::new("c")]);
        mesh.set_latency("a", Duration::from_millis(500));
        mesh.set_latency("b", Duration::from_millis(200));
        mesh.set_latency("c", Duration::from_millis(800));

        let selector = selector(&mesh, &config(MetricKind::Rtt));
        let best = selector.get_best_path(&dest).await.unwrap();
        assert_eq!(best.path.id.0, "b");
        assert!((best.value - 0.2).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_reused_within_half_interval() {
        let mesh = MemoryMesh::new();
        let dest = AddressHash::random();
        mesh.set_paths(dest, vec![PathInfo::new("only")]);
        mesh.set_latency("only", Duration::from_millis(10));

        let selector = selector(&mesh, &config(MetricKind::Rtt));
        selector.get_best_path(&dest).await.unwrap();
        tokio::time::advance(Duration::from_secs(29)).await;
        selector.get_best_path(&dest).await.unwrap();
        assert_eq!(mesh.probe_count(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        selector.get_best_path(&dest).await.unwrap();
        assert_eq!(mesh.probe_count(), 2);
    }

    #[tokio::test]
    async fn test_hops_and_truncation() {
        let mesh = MemoryMesh::new();
        let dest = AddressHash::random();
        mesh.set_paths(
            dest,
            vec![
                PathInfo::new("p5").with_hops(5),
                PathInfo::new("p2").with_hops(2),
                PathInfo::new("p8").with_hops(8),
                PathInfo::new("p1").with_hops(1),
            ],
        );

        let mut cfg = config(MetricKind::Hops);
        cfg.max_paths_to_consider = 3;
        let best = selector(&mesh, &cfg).get_best_path(&dest).await.unwrap();
        assert_eq!(best.path.id.0, "p2");
        assert_eq!(best.value, 2.0);
    }

    #[tokio::test]
    async fn test_ties_and_missing_values() {
        let mesh = MemoryMesh::new();
        let dest = AddressHash::random();
        mesh.set_paths(
            dest,
            vec![
                PathInfo::new("unknown"),
                PathInfo::new("first").with_quality(0.3),
                PathInfo::new("second").with_quality(0.3),
            ],
        );
        let best = selector(&mesh, &config(MetricKind::LinkQuality))
            .get_best_path(&dest)
            .await
            .unwrap();
        assert_eq!(best.path.id.0, "first");
    }

    #[tokio::test]
    async fn test_custom_evaluator_errors_score_infinite() {
        let mesh = MemoryMesh::new();
        let dest = AddressHash::random();
        mesh.set_paths(dest, vec![PathInfo::new("bad"), PathInfo::new("good")]);

        let registry = EvaluatorRegistry::new();
        registry.register(
            "named",
            Arc::new(|_: &AddressHash, p: &PathInfo| {
                if p.id.0 == "bad" {
                    Err(EvaluatorError("probe exploded".into()))
                } else {
                    Ok(4.0)
                }
            }),
        );
        let mut cfg = config(MetricKind::Custom);
        cfg.custom_metrics_module = Some("named".into());
        let selector = PathSelector::new(&cfg, Some(Arc::new(mesh.node())), registry);

        let best = selector.get_best_path(&dest).await.unwrap();
        assert_eq!(best.path.id.0, "good");
        let bad = selector.cache().get(&"bad".into(), MetricKind::Custom).unwrap();
        assert!(bad.value.is_infinite());
    }

    #[tokio::test]
    async fn test_panicking_evaluator_scores_infinite() {
        let mesh = MemoryMesh::new();
        let dest = AddressHash::random();
        mesh.set_paths(dest, vec![PathInfo::new("bad"), PathInfo::new("good")]);

        let registry = EvaluatorRegistry::new();
        registry.register(
            "named",
            Arc::new(|_: &AddressHash, p: &PathInfo| {
                if p.id.0 == "bad" {
                    panic!("evaluator bug");
                }
                Ok::<_, EvaluatorError>(2.0)
            }),
        );
        let mut cfg = config(MetricKind::Custom);
        cfg.custom_metrics_module = Some("named".into());
        let selector = Arc::new(PathSelector::new(&cfg, Some(Arc::new(mesh.node())), registry));

        let task = tokio::spawn({
            let selector = selector.clone();
            async move { selector.get_best_path(&dest).await }
        });
        let best = task.await.unwrap().unwrap();
        assert_eq!(best.path.id.0, "good");
        let bad = selector.cache().get(&"bad".into(), MetricKind::Custom).unwrap();
        assert!(bad.value.is_infinite());
    }

    #[tokio::test]
    async fn test_no_paths_or_transport() {
        let mesh = MemoryMesh::new();
        let selector = selector(&mesh, &config(MetricKind::Rtt));
        assert!(selector.get_best_path(&AddressHash::random()).await.is_none());

        let detached = PathSelector::new(&config(MetricKind::Rtt), None, EvaluatorRegistry::new());
        assert!(detached.get_best_path(&AddressHash::random()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_update_respects_interval() {
        let mesh = MemoryMesh::new();
        let dest = AddressHash::random();
        mesh.set_paths(dest, vec![PathInfo::new("p")]);
        mesh.set_latency("p", Duration::from_millis(5));

        let selector = selector(&mesh, &config(MetricKind::Rtt));
        selector.get_best_path(&dest).await.unwrap();
        assert_eq!(mesh.probe_count(), 1);

        // First tick runs but the cached value is still fresh.
        selector.periodic_update().await;
        assert_eq!(mesh.probe_count(), 1);

        tokio::time::advance(Duration::from_secs(45)).await;
        selector.periodic_update().await;
        assert_eq!(mesh.probe_count(), 1, "interval not elapsed since last tick");

        tokio::time::advance(Duration::from_secs(20)).await;
        selector.periodic_update().await;
        assert_eq!(mesh.probe_count(), 2);
        assert_eq!(selector.status().known_destinations, 1);
    }
}
