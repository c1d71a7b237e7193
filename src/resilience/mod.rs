//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Remote operation:
//!     → timeouts.rs (every wait on the mesh has a deadline)
//!     → retries.rs (retry transient failures with backoff)
//!     → circuit_breaker.rs (gate each attempt, open after repeated failure)
//! ```
//!
//! # Design Decisions
//! - One breaker per operation name, created on first use, never destroyed
//! - Retries wrap the breaker, so an open circuit ends the retry loop at once
//! - Errors are never masked: callers always see the operation's own error

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;
pub mod timeouts;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::config::CircuitBreakerConfig;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitError, CircuitState};
pub use retries::{ExecutionStats, RetryError, RetryExecutor, RetryPolicy};
pub use timeouts::{duration_from_secs, with_deadline, DeadlineExceeded};

/// Named circuit breakers sharing one set of defaults.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: ArcSwap<CircuitBreakerConfig>,
}

impl BreakerRegistry {
    pub fn new(defaults: &CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults: ArcSwap::from_pointee(defaults.clone()),
        }
    }

    /// The breaker for `name`, created from the current defaults if new.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::from_config(name, &self.defaults.load())))
            .clone()
    }

    /// New defaults, also applied to every existing breaker.
    pub fn update_config(&self, defaults: &CircuitBreakerConfig) {
        self.defaults.store(Arc::new(defaults.clone()));
        for breaker in self.breakers.iter() {
            breaker.update_config(defaults);
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Snapshots sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

/// Retry `operation`, gating every attempt through `breaker`.
///
/// An open circuit is not retried; inner errors are retried when
/// `is_retryable` holds. Only retryable errors count against the breaker,
/// the rest are the caller's own.
pub async fn retry_with_breaker<F, Fut, T, E, P>(
    executor: &RetryExecutor,
    breaker: &CircuitBreaker,
    operation_name: &str,
    policy: Option<&RetryPolicy>,
    mut operation: F,
    is_retryable: P,
) -> Result<T, RetryError<CircuitError<E>>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let is_retryable = &is_retryable;
    executor
        .execute_with_retry_if(
            operation_name,
            policy,
            move || {
                let attempt = operation();
                breaker.execute_if(move || attempt, is_retryable)
            },
            |e: &CircuitError<E>| match e {
                CircuitError::Open { .. } => false,
                CircuitError::Inner(inner) => is_retryable(inner),
            },
        )
        .await
}
