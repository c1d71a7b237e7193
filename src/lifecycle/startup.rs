//! Startup orchestration and the main loop.
//!
//! # Responsibilities
//! - Build the transport selected by `[core].transport`
//! - Enable, update or disable each optional feature from its config section
//! - Tick path selection and relay housekeeping on the main-loop interval
//! - Apply reloaded configuration and stop features on shutdown
//!
//! # Design Decisions
//! - Reload re-runs the same per-feature create/update/disable step as startup
//! - A feature that fails to start is logged and left disabled
//! - Feature handles are cloned out of the lock before any await

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::Span;

use crate::config::{AresConfig, TransportKind};
use crate::lifecycle::Shutdown;
use crate::observability::{metrics, LogHandle};
use crate::path_selection::{EvaluatorRegistry, PathSelector, SelectorStatus};
use crate::relay::{ProxyRelay, RelayError, RelayStatus};
use crate::resilience::{
    retry_with_breaker, BreakerRegistry, BreakerSnapshot, CircuitError, ExecutionStats,
    RetryError, RetryExecutor,
};
use crate::transport::memory::MemoryMesh;
use crate::transport::MeshTransport;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Failure of a guarded relay request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("destination proxying is disabled")]
    ProxyingDisabled,

    #[error("circuit {0} is open")]
    CircuitOpen(String),

    #[error("relay request failed after {attempts} attempt(s): {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: RelayError,
    },
}

impl From<RetryError<CircuitError<RelayError>>> for RequestError {
    fn from(err: RetryError<CircuitError<RelayError>>) -> Self {
        let attempts = err.attempts();
        match err.into_inner() {
            CircuitError::Open { name } => RequestError::CircuitOpen(name),
            CircuitError::Inner(source) => RequestError::Failed { attempts, source },
        }
    }
}

/// Transport for the configured kind.
pub fn build_transport(kind: TransportKind) -> Option<Arc<dyn MeshTransport>> {
    match kind {
        TransportKind::Loopback => Some(Arc::new(MemoryMesh::new().node())),
        TransportKind::Disabled => None,
    }
}

#[derive(Default, Clone)]
struct Features {
    retries: Option<Arc<RetryExecutor>>,
    paths: Option<Arc<PathSelector>>,
    relay: Option<ProxyRelay>,
}

impl Features {
    fn count(&self) -> usize {
        usize::from(self.retries.is_some())
            + usize::from(self.paths.is_some())
            + usize::from(self.relay.is_some())
    }
}

/// Snapshot served by the admin `/status` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AresStatus {
    pub version: &'static str,
    pub uptime_secs: u64,
    pub transport: bool,
    pub active_features: usize,
    pub retries: Option<ExecutionStats>,
    pub path_selection: Option<SelectorStatus>,
    pub proxy: Option<RelayStatus>,
    pub circuit_breakers: Vec<BreakerSnapshot>,
}

/// The running application: config snapshot plus optional features.
pub struct Ares {
    config: ArcSwap<AresConfig>,
    transport: Option<Arc<dyn MeshTransport>>,
    evaluators: EvaluatorRegistry,
    breakers: BreakerRegistry,
    features: Mutex<Features>,
    log_handle: Option<LogHandle>,
    started_at: Instant,
    span: Span,
}

impl Ares {
    /// Create the application without enabling any feature yet.
    pub fn new(config: AresConfig, transport: Option<Arc<dyn MeshTransport>>) -> Self {
        let breakers = BreakerRegistry::new(&config.circuit_breaker);
        Self {
            config: ArcSwap::from_pointee(config),
            transport,
            evaluators: EvaluatorRegistry::new(),
            breakers,
            features: Mutex::new(Features::default()),
            log_handle: None,
            started_at: Instant::now(),
            span: tracing::info_span!("ares"),
        }
    }

    /// Use `evaluators` for the `custom` path metric.
    pub fn with_evaluators(mut self, evaluators: EvaluatorRegistry) -> Self {
        self.evaluators = evaluators;
        self
    }

    /// Re-apply log levels from reloaded config through `handle`.
    pub fn with_log_handle(mut self, handle: LogHandle) -> Self {
        self.log_handle = Some(handle);
        self
    }

    fn features(&self) -> MutexGuard<'_, Features> {
        self.features.lock().expect("features mutex poisoned")
    }

    pub fn config(&self) -> Arc<AresConfig> {
        self.config.load_full()
    }

    pub fn evaluators(&self) -> &EvaluatorRegistry {
        &self.evaluators
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn transport(&self) -> Option<Arc<dyn MeshTransport>> {
        self.transport.clone()
    }

    pub fn retry_executor(&self) -> Option<Arc<RetryExecutor>> {
        self.features().retries.clone()
    }

    pub fn path_selector(&self) -> Option<Arc<PathSelector>> {
        self.features().paths.clone()
    }

    pub fn proxy_relay(&self) -> Option<ProxyRelay> {
        self.features().relay.clone()
    }

    pub fn active_features(&self) -> usize {
        self.features().count()
    }

    /// Enable the features of the current configuration.
    pub fn init_features(&self) {
        let config = self.config();
        self.apply_features(&config);
    }

    /// Store `config` and create, update or disable every feature to match it.
    pub fn apply_config(&self, config: AresConfig) {
        let config = Arc::new(config);
        self.config.store(config.clone());

        if let Some(handle) = &self.log_handle {
            if let Err(e) = handle.apply(&config.logging) {
                tracing::warn!(parent: &self.span, error = %e, "Log levels not updated");
            }
        }
        self.breakers.update_config(&config.circuit_breaker);
        self.apply_features(&config);
    }

    fn apply_features(&self, config: &AresConfig) {
        let mut retired_relay = None;
        let count = {
            let mut features = self.features();

            features.retries = match (config.request_retries.enabled, features.retries.take()) {
                (true, Some(existing)) => {
                    existing.update_config(&config.request_retries);
                    Some(existing)
                }
                (true, None) => {
                    tracing::info!(parent: &self.span, "Request retries enabled");
                    Some(Arc::new(RetryExecutor::new(&config.request_retries)))
                }
                (false, Some(_)) => {
                    tracing::info!(parent: &self.span, "Request retries disabled");
                    None
                }
                (false, None) => None,
            };

            features.paths = match (config.path_selection.enabled, features.paths.take()) {
                (true, Some(existing)) => {
                    existing.update_config(&config.path_selection);
                    Some(existing)
                }
                (true, None) => {
                    tracing::info!(parent: &self.span, "Path selection enabled");
                    Some(Arc::new(PathSelector::new(
                        &config.path_selection,
                        self.transport.clone(),
                        self.evaluators.clone(),
                    )))
                }
                (false, Some(_)) => {
                    tracing::info!(parent: &self.span, "Path selection disabled");
                    None
                }
                (false, None) => None,
            };

            features.relay = match (config.destination_proxying.enabled, features.relay.take()) {
                (true, Some(existing)) => {
                    if let Err(e) = existing.apply_config(&config.destination_proxying) {
                        tracing::error!(parent: &self.span, error = %e, "Proxy relay update failed");
                    }
                    Some(existing)
                }
                (true, None) => {
                    match ProxyRelay::new(&config.destination_proxying, self.transport.clone()) {
                        Ok(relay) => {
                            tracing::info!(parent: &self.span, role = ?relay.role(), "Destination proxying enabled");
                            Some(relay)
                        }
                        Err(e) => {
                            tracing::error!(parent: &self.span, error = %e, "Proxy relay failed to start");
                            None
                        }
                    }
                }
                (false, Some(existing)) => {
                    tracing::info!(parent: &self.span, "Destination proxying disabled");
                    retired_relay = Some(existing);
                    None
                }
                (false, None) => None,
            };

            features.count()
        };

        if let Some(relay) = retired_relay {
            relay.shutdown();
        }
        metrics::set_active_features(count);
        tracing::info!(parent: &self.span, active_features = count, "Features applied");
    }

    /// One main-loop iteration of feature housekeeping.
    pub async fn tick(&self) {
        let features = self.features().clone();
        if let Some(paths) = features.paths {
            paths.periodic_update().await;
        }
        if let Some(relay) = features.relay {
            relay.periodic_check();
        }
    }

    /// Run until `shutdown`, applying config updates as they arrive.
    pub async fn run(self: Arc<Self>, mut updates: mpsc::UnboundedReceiver<AresConfig>, shutdown: Shutdown) {
        tracing::info!(parent: &self.span, "Main loop started");
        loop {
            let interval = Duration::from_secs(self.config.load().core.main_loop_interval_secs.max(1));
            tokio::select! {
                _ = shutdown.wait() => break,
                Some(config) = updates.recv() => {
                    tracing::info!(parent: &self.span, "Applying configuration update");
                    self.apply_config(config);
                }
                _ = tokio::time::sleep(interval) => self.tick().await,
            }
        }
        self.stop();
    }

    /// Shut every feature down. Safe to call more than once.
    pub fn stop(&self) {
        let features = std::mem::take(&mut *self.features());
        if let Some(relay) = features.relay {
            relay.shutdown();
        }
        metrics::set_active_features(0);
        tracing::info!(parent: &self.span, "Features stopped");
    }

    /// Send through the proxy relay under the breaker for `alias`, retrying
    /// transient failures when retries are enabled. Only transient failures
    /// count against the breaker; bad input or a missing route does not.
    pub async fn request_via_proxy(
        &self,
        target: &str,
        payload: &[u8],
        alias: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RequestError> {
        let (relay, executor) = {
            let features = self.features();
            (features.relay.clone(), features.retries.clone())
        };
        let relay = relay.ok_or(RequestError::ProxyingDisabled)?;
        let name = format!("proxy:{}", alias.unwrap_or("default"));
        let breaker = self.breakers.get(&name);

        match executor {
            Some(executor) => Ok(retry_with_breaker(
                &executor,
                &breaker,
                &name,
                None,
                || relay.request(target, payload, alias, timeout),
                RelayError::is_transient,
            )
            .await?),
            None => breaker
                .execute_if(
                    || relay.request(target, payload, alias, timeout),
                    RelayError::is_transient,
                )
                .await
                .map_err(|e| match e {
                    CircuitError::Open { name } => RequestError::CircuitOpen(name),
                    CircuitError::Inner(source) => RequestError::Failed { attempts: 1, source },
                }),
        }
    }

    pub fn status(&self) -> AresStatus {
        let features = self.features().clone();
        AresStatus {
            version: VERSION,
            uptime_secs: self.started_at.elapsed().as_secs(),
            transport: self.transport.is_some(),
            active_features: features.count(),
            retries: features.retries.as_ref().map(|r| r.stats()),
            path_selection: features.paths.as_ref().map(|p| p.status()),
            proxy: features.relay.as_ref().map(|r| r.status()),
            circuit_breakers: self.breakers.snapshots(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayRole;
    use crate::resilience::CircuitState;

    fn config() -> AresConfig {
        let mut config = AresConfig::default();
        config.request_retries.enabled = true;
        config.path_selection.enabled = true;
        config.destination_proxying.enabled = true;
        config
    }

    #[tokio::test]
    async fn test_features_follow_config() {
        let ares = Ares::new(config(), build_transport(TransportKind::Loopback));
        assert_eq!(ares.active_features(), 0);
        ares.init_features();
        assert_eq!(ares.active_features(), 3);
        let executor = ares.retry_executor().unwrap();

        let mut updated = config();
        updated.request_retries.default_max_retries = 7;
        updated.path_selection.enabled = false;
        ares.apply_config(updated);

        assert_eq!(ares.active_features(), 2);
        assert!(ares.path_selector().is_none());
        let same = ares.retry_executor().unwrap();
        assert!(Arc::ptr_eq(&executor, &same));
        assert_eq!(same.policy().max_retries, 7);
    }

    #[tokio::test]
    async fn test_relay_role_switch_on_reload() {
        let ares = Ares::new(config(), build_transport(TransportKind::Loopback));
        ares.init_features();
        assert_eq!(ares.proxy_relay().unwrap().role(), RelayRole::Client);

        let mut node = config();
        node.destination_proxying.is_proxy_node = true;
        ares.apply_config(node);
        let relay = ares.proxy_relay().unwrap();
        assert_eq!(relay.role(), RelayRole::Node);
        assert!(relay.listen_endpoint().is_some());

        let mut off = config();
        off.destination_proxying.enabled = false;
        ares.apply_config(off);
        assert!(ares.proxy_relay().is_none());
        assert!(relay.listen_endpoint().is_none());
    }

    #[tokio::test]
    async fn test_node_without_transport_stays_disabled() {
        let mut node = config();
        node.destination_proxying.is_proxy_node = true;
        let ares = Ares::new(node, build_transport(TransportKind::Disabled));
        ares.init_features();
        assert!(ares.proxy_relay().is_none());
        assert_eq!(ares.active_features(), 2);
    }

    #[tokio::test]
    async fn test_request_requires_proxying() {
        let ares = Ares::new(AresConfig::default(), None);
        ares.init_features();
        let err = ares
            .request_via_proxy("00", b"x", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::ProxyingDisabled));
    }

    #[tokio::test]
    async fn test_request_without_route_is_not_retried() {
        let ares = Ares::new(config(), build_transport(TransportKind::Loopback));
        ares.init_features();
        let target = crate::transport::AddressHash::random().to_hex();
        let err = ares
            .request_via_proxy(&target, b"x", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            RequestError::Failed { attempts, source } => {
                assert_eq!(attempts, 1);
                assert!(matches!(source, RelayError::RouteNotFound(None)));
            }
            other => panic!("unexpected {other:?}"),
        }
        let stats = ares.retry_executor().unwrap().stats();
        assert_eq!(stats.failures_after_retries, 1);
        assert_eq!(ares.status().circuit_breakers[0].name, "proxy:default");
        assert_eq!(ares.breakers().get("proxy:default").failure_count(), 0);
    }

    #[tokio::test]
    async fn test_local_failures_leave_breaker_closed() {
        let mut no_retries = config();
        no_retries.request_retries.enabled = false;

        for config in [config(), no_retries] {
            let mut config = config;
            config.circuit_breaker.failure_threshold = 2;
            let ares = Ares::new(config, build_transport(TransportKind::Loopback));
            ares.init_features();

            for _ in 0..4 {
                let err = ares
                    .request_via_proxy("not-hex", b"x", None, Duration::from_secs(1))
                    .await
                    .unwrap_err();
                assert!(matches!(
                    err,
                    RequestError::Failed {
                        attempts: 1,
                        source: RelayError::RouteNotFound(None)
                    }
                ));
            }
            let breaker = ares.breakers().get("proxy:default");
            assert_eq!(breaker.state(), CircuitState::Closed);
            assert_eq!(breaker.failure_count(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_applies_updates_and_stops() {
        let ares = Arc::new(Ares::new(config(), build_transport(TransportKind::Loopback)));
        ares.init_features();
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(ares.clone().run(rx, shutdown.clone()));

        let mut updated = config();
        updated.path_selection.enabled = false;
        tx.send(updated).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(ares.path_selector().is_none());

        tokio::time::sleep(Duration::from_secs(65)).await;
        shutdown.trigger();
        handle.await.unwrap();
        assert_eq!(ares.active_features(), 0);
    }
}
