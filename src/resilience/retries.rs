//! Bounded retry with exponential backoff and jitter.
//!
//! # Responsibilities
//! - Re-run a failed operation up to `max_retries` more times
//! - Sleep between attempts without blocking other tasks
//! - Keep process-wide execution counters and report each outcome
//!
//! # Design Decisions
//! - `executions` counts calls, not attempts
//! - A non-retryable error stops immediately and counts as a failure
//! - The error returned is always the operation's own last error

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::Span;

use crate::config::RetryConfig;
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;
use crate::resilience::timeouts::duration_from_secs;

/// How many times to try, and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub jitter_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.default_max_retries,
            base_delay: duration_from_secs(config.default_delay_seconds),
            backoff_factor: config.default_backoff_factor,
            jitter_max: duration_from_secs(config.default_jitter_max_seconds),
        }
    }

    /// A policy that never waits, for callers that only want bounded attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            backoff_factor: 1.0,
            jitter_max: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last error.
    #[error("operation '{operation}' failed after {attempts} attempts: {last_error}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last_error: E,
    },

    /// Failed with an error the policy does not retry.
    #[error("operation '{operation}' failed on attempt {attempt}: {last_error}")]
    NonRetryable {
        operation: String,
        attempt: u32,
        last_error: E,
    },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last_error, .. } | RetryError::NonRetryable { last_error, .. } => {
                last_error
            }
        }
    }

    pub fn inner(&self) -> &E {
        match self {
            RetryError::Exhausted { last_error, .. } | RetryError::NonRetryable { last_error, .. } => {
                last_error
            }
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::NonRetryable { attempt, .. } => *attempt,
        }
    }
}

/// Copy of the process-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    pub executions: u64,
    pub successes: u64,
    pub successes_on_retry: u64,
    pub failures_after_retries: u64,
}

#[derive(Default)]
struct Counters {
    executions: AtomicU64,
    successes: AtomicU64,
    successes_on_retry: AtomicU64,
    failures_after_retries: AtomicU64,
}

struct RetrySettings {
    policy: RetryPolicy,
    log_retries: bool,
}

/// Runs operations under a retry policy.
pub struct RetryExecutor {
    settings: ArcSwap<RetrySettings>,
    counters: Counters,
    span: Span,
}

impl RetryExecutor {
    pub fn new(config: &RetryConfig) -> Self {
        let span = tracing::info_span!("retry_executor");
        let executor = Self {
            settings: ArcSwap::from_pointee(RetrySettings {
                policy: RetryPolicy::from_config(config),
                log_retries: config.log_retries,
            }),
            counters: Counters::default(),
            span,
        };
        executor.log_settings();
        executor
    }

    /// Swap in new defaults; calls already running keep their policy.
    pub fn update_config(&self, config: &RetryConfig) {
        self.settings.store(Arc::new(RetrySettings {
            policy: RetryPolicy::from_config(config),
            log_retries: config.log_retries,
        }));
        self.log_settings();
    }

    fn log_settings(&self) {
        let settings = self.settings.load();
        tracing::info!(
            parent: &self.span,
            max_retries = settings.policy.max_retries,
            base_delay_secs = settings.policy.base_delay.as_secs_f64(),
            backoff_factor = settings.policy.backoff_factor,
            jitter_max_secs = settings.policy.jitter_max.as_secs_f64(),
            "Retry policy configured"
        );
    }

    /// Current default policy.
    pub fn policy(&self) -> RetryPolicy {
        self.settings.load().policy.clone()
    }

    pub fn stats(&self) -> ExecutionStats {
        ExecutionStats {
            executions: self.counters.executions.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            successes_on_retry: self.counters.successes_on_retry.load(Ordering::Relaxed),
            failures_after_retries: self.counters.failures_after_retries.load(Ordering::Relaxed),
        }
    }

    /// Retry every error. `policy` overrides the configured default.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        operation_name: &str,
        policy: Option<&RetryPolicy>,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_with_retry_if(operation_name, policy, operation, |_| true)
            .await
    }

    /// Retry only errors for which `is_retryable` holds.
    pub async fn execute_with_retry_if<F, Fut, T, E, P>(
        &self,
        operation_name: &str,
        policy: Option<&RetryPolicy>,
        mut operation: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let (policy, log_retries) = {
            let settings = self.settings.load();
            (
                policy.cloned().unwrap_or_else(|| settings.policy.clone()),
                settings.log_retries,
            )
        };
        let max_attempts = policy.max_retries.saturating_add(1);
        let started = Instant::now();
        self.counters.executions.fetch_add(1, Ordering::Relaxed);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if log_retries && attempt > 1 {
                tracing::info!(parent: &self.span, operation = operation_name, attempt, max_attempts, "Retrying");
            }

            let error = match operation().await {
                Ok(value) => {
                    self.counters.successes.fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        self.counters.successes_on_retry.fetch_add(1, Ordering::Relaxed);
                    }
                    metrics::record_retry_outcome(operation_name, true, attempt, started.elapsed());
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !is_retryable(&error) {
                self.record_failure(operation_name, attempt, started);
                tracing::error!(
                    parent: &self.span,
                    operation = operation_name,
                    attempt,
                    error = %error,
                    "Non-retryable error"
                );
                return Err(RetryError::NonRetryable {
                    operation: operation_name.to_string(),
                    attempt,
                    last_error: error,
                });
            }

            if log_retries {
                tracing::warn!(parent: &self.span, operation = operation_name, attempt, error = %error, "Attempt failed");
            }

            if attempt >= max_attempts {
                self.record_failure(operation_name, attempt, started);
                tracing::error!(
                    parent: &self.span,
                    operation = operation_name,
                    retries = attempt - 1,
                    error = %error,
                    "Operation failed after retries"
                );
                return Err(RetryError::Exhausted {
                    operation: operation_name.to_string(),
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = calculate_backoff(attempt, policy.base_delay, policy.backoff_factor, policy.jitter_max);
            if log_retries {
                tracing::info!(
                    parent: &self.span,
                    operation = operation_name,
                    delay_secs = delay.as_secs_f64(),
                    "Backing off"
                );
            }
            tokio::time::sleep(delay).await;
        }
    }

    fn record_failure(&self, operation_name: &str, attempts: u32, started: Instant) {
        self.counters.failures_after_retries.fetch_add(1, Ordering::Relaxed);
        metrics::record_retry_outcome(operation_name, false, attempts, started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn executor() -> RetryExecutor {
        let config = RetryConfig {
            enabled: true,
            default_max_retries: 3,
            default_delay_seconds: 0.1,
            default_backoff_factor: 2.0,
            default_jitter_max_seconds: 0.0,
            log_retries: true,
        };
        RetryExecutor::new(&config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt() {
        let executor = executor();
        let calls = AtomicU32::new(0);

        let started = Instant::now();
        let result = executor
            .execute_with_retry("flaky", None, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("failure {n}"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 0.1s + 0.2s of backoff
        assert!(started.elapsed() >= Duration::from_millis(300));

        let stats = executor.stats();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.successes_on_retry, 1);
        assert_eq!(stats.failures_after_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max_attempts() {
        let executor = executor();
        for max_retries in 0..5 {
            let calls = AtomicU32::new(0);
            let policy = RetryPolicy::immediate(max_retries);
            let err = executor
                .execute_with_retry("down", Some(&policy), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("unavailable")
                })
                .await
                .unwrap_err();

            assert_eq!(calls.load(Ordering::SeqCst), max_retries + 1);
            assert_eq!(err.attempts(), max_retries + 1);
            assert!(matches!(err, RetryError::Exhausted { last_error: "unavailable", .. }));
        }
        assert_eq!(executor.stats().failures_after_retries, 5);
        assert_eq!(executor.stats().executions, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let executor = executor();
        let calls = AtomicU32::new(0);
        let err = executor
            .execute_with_retry_if(
                "strict",
                None,
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("bad request")
                },
                |e| *e != "bad request",
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RetryError::NonRetryable { attempt: 1, .. }));
        assert_eq!(err.into_inner(), "bad request");
        assert_eq!(executor.stats().failures_after_retries, 1);
    }

    #[tokio::test]
    async fn test_update_config_changes_default_policy() {
        let executor = executor();
        let mut config = RetryConfig::default();
        config.default_max_retries = 7;
        executor.update_config(&config);
        assert_eq!(executor.policy().max_retries, 7);
    }
}
