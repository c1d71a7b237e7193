//! Deadlines for calls into the transport.
//!
//! Every wait on a remote party is bounded by one of these.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} timed out after {after:?}")]
pub struct DeadlineExceeded {
    pub operation: &'static str,
    pub after: Duration,
}

/// Await `fut` for at most `after`.
pub async fn with_deadline<F: Future>(
    operation: &'static str,
    after: Duration,
    fut: F,
) -> Result<F::Output, DeadlineExceeded> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| DeadlineExceeded { operation, after })
}

/// Seconds from config to a `Duration`: negative and NaN become zero,
/// values too large to represent saturate.
pub fn duration_from_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_from_secs() {
        assert_eq!(duration_from_secs(1.5), Duration::from_millis(1500));
        assert_eq!(duration_from_secs(-3.0), Duration::ZERO);
        assert_eq!(duration_from_secs(f64::NAN), Duration::ZERO);
        assert_eq!(duration_from_secs(f64::INFINITY), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline() {
        let ok = with_deadline("quick", Duration::from_secs(1), async { 5 }).await;
        assert_eq!(ok, Ok(5));

        let err = with_deadline("stuck", Duration::from_secs(1), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(err.operation, "stuck");
        assert_eq!(err.to_string(), "stuck timed out after 1s");
    }
}
