//! Circuit breaker for remote operations.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: operation assumed down, calls fail fast
//! - Half-Open: one trial call decides whether it recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold
//! Open → Half-Open: next call after recovery timeout since the last failure
//! Half-Open → Closed: trial call succeeds (count reset)
//! Half-Open → Open: trial call fails
//! ```
//!
//! # Design Decisions
//! - One breaker per operation name (see `BreakerRegistry`)
//! - Fail fast in Open state; the timeout is checked lazily, no timers
//! - Single trial in Half-Open; concurrent callers are rejected meanwhile
//! - The wrapped operation's error is always returned to the caller

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::Span;

use crate::config::CircuitBreakerConfig;
use crate::observability::metrics;
use crate::resilience::timeouts::duration_from_secs;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

/// Result of a breaker-guarded call.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// Rejected without invoking the operation.
    #[error("circuit '{name}' is open")]
    Open { name: String },

    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Open { .. } => None,
            CircuitError::Inner(e) => Some(e),
        }
    }
}

/// Point-in-time view for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

pub struct CircuitBreaker {
    name: String,
    inner: Mutex<BreakerInner>,
    span: Span,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        let name = name.into();
        let span = tracing::info_span!("circuit_breaker", name = %name);
        tracing::info!(
            parent: &span,
            failure_threshold,
            recovery_timeout_secs = recovery_timeout.as_secs_f64(),
            "Circuit breaker created"
        );
        metrics::record_breaker_state(&name, CircuitState::Closed.gauge_value());
        Self {
            name,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
                failure_threshold,
                recovery_timeout,
            }),
            span,
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            duration_from_secs(config.recovery_timeout_seconds),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().expect("circuit breaker mutex poisoned")
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: inner.failure_threshold,
            recovery_timeout_secs: inner.recovery_timeout.as_secs_f64(),
        }
    }

    /// Apply new limits; the current state and counters are kept.
    pub fn update_config(&self, config: &CircuitBreakerConfig) {
        let mut inner = self.lock();
        inner.failure_threshold = config.failure_threshold;
        inner.recovery_timeout = duration_from_secs(config.recovery_timeout_seconds);
    }

    /// Run `operation` if the breaker admits it.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_if(operation, |_| true).await
    }

    /// Like [`execute`](Self::execute), but an error for which
    /// `counts_as_failure` is false leaves the failure count and state alone.
    /// A half-open trial that ends that way frees the slot for the next caller.
    pub async fn execute_if<F, Fut, T, E, C>(
        &self,
        operation: F,
        counts_as_failure: C,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        let admission = self.admit::<E>()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };

        let result = operation().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.on_success(admission);
                Ok(value)
            }
            Err(e) => {
                if counts_as_failure(&e) {
                    self.on_failure(admission);
                } else {
                    self.on_ignored(admission);
                }
                Err(CircuitError::Inner(e))
            }
        }
    }

    fn admit<E>(&self) -> Result<Admission, CircuitError<E>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() > inner.recovery_timeout);
                if recovered {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    Ok(Admission::Trial)
                } else {
                    Err(self.rejection())
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.rejection())
                } else {
                    inner.trial_in_flight = true;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    fn rejection<E>(&self) -> CircuitError<E> {
        tracing::debug!(parent: &self.span, "Call rejected, circuit open");
        CircuitError::Open {
            name: self.name.clone(),
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.lock();
        match admission {
            Admission::Trial => {
                inner.trial_in_flight = false;
                inner.failure_count = 0;
                inner.last_failure = None;
                self.transition(&mut inner, CircuitState::Closed);
            }
            Admission::Normal => {
                if inner.state == CircuitState::Closed && inner.failure_count > 0 {
                    inner.failure_count = 0;
                    inner.last_failure = None;
                    tracing::info!(parent: &self.span, "Success, failure counter reset");
                }
            }
        }
    }

    fn on_ignored(&self, admission: Admission) {
        tracing::debug!(parent: &self.span, "Guarded call failed locally, not counted");
        if admission == Admission::Trial {
            self.lock().trial_in_flight = false;
        }
    }

    fn on_failure(&self, admission: Admission) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        tracing::warn!(
            parent: &self.span,
            failure_count = inner.failure_count,
            failure_threshold = inner.failure_threshold,
            trial = admission == Admission::Trial,
            "Guarded call failed"
        );

        match admission {
            Admission::Trial => {
                inner.trial_in_flight = false;
                self.transition(&mut inner, CircuitState::Open);
            }
            Admission::Normal => {
                if inner.state == CircuitState::Closed && inner.failure_count >= inner.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        match to {
            CircuitState::Open => tracing::warn!(
                parent: &self.span,
                from = ?inner.state,
                recovery_timeout_secs = inner.recovery_timeout.as_secs_f64(),
                "Circuit opened"
            ),
            _ => tracing::info!(parent: &self.span, from = ?inner.state, to = ?to, "Circuit state changed"),
        }
        inner.state = to;
        metrics::record_breaker_state(&self.name, to.gauge_value());
    }
}

/// Releases the trial slot if the guarded future is dropped mid-call.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        breaker.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, CircuitError<&'static str>> {
        breaker.execute(|| async { Ok(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold_and_rejects() {
        let breaker = CircuitBreaker::new("op", 2, Duration::from_secs(10));
        assert!(matches!(fail(&breaker).await, Err(CircuitError::Inner("boom"))));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 2);

        let calls = AtomicUsize::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncounted_errors_keep_circuit_closed() {
        let breaker = CircuitBreaker::new("op", 2, Duration::from_secs(10));
        for _ in 0..5 {
            let err = breaker
                .execute_if(|| async { Err::<(), _>("bad input") }, |_| false)
                .await
                .unwrap_err();
            assert!(!err.is_open());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncounted_trial_frees_slot() {
        let breaker = CircuitBreaker::new("op", 1, Duration::from_secs(10));
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(11)).await;

        breaker
            .execute_if(|| async { Err::<(), _>("bad input") }, |_| false)
            .await
            .unwrap_err();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::new("op", 1, Duration::from_millis(100));
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("op", 1, Duration::from_millis(100));
        assert!(fail(&breaker).await.is_err());

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(matches!(fail(&breaker).await, Err(CircuitError::Inner(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 2);
        assert!(succeed(&breaker).await.unwrap_err().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_success_resets_count() {
        let breaker = CircuitBreaker::new("op", 3, Duration::from_secs(1));
        assert!(fail(&breaker).await.is_err());
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.failure_count(), 2);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_in_half_open() {
        let breaker = Arc::new(CircuitBreaker::new("op", 1, Duration::from_millis(10)));
        assert!(fail(&breaker).await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _ = release_rx.await;
                        Ok::<_, &str>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(succeed(&breaker).await.unwrap_err().is_open());

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_slot() {
        let breaker = CircuitBreaker::new("op", 1, Duration::from_millis(10));
        assert!(fail(&breaker).await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let pending = breaker.execute(|| std::future::pending::<Result<(), &str>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(5), pending).await;
        assert!(timed_out.is_err());

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
