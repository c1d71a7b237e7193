//! Exponential backoff with symmetric jitter.

use std::time::Duration;

use crate::resilience::timeouts::duration_from_secs;

/// Delay before the attempt following failed attempt number `attempt` (1-based).
///
/// `base * factor^(attempt-1)`, plus a uniform offset in `[-jitter_max, +jitter_max]`
/// when `jitter_max` is non-zero, clamped to zero.
pub fn calculate_backoff(attempt: u32, base: Duration, factor: f64, jitter_max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
    let mut delay = base.as_secs_f64() * factor.powi(exponent);

    let jitter = jitter_max.as_secs_f64();
    if jitter > 0.0 {
        delay += (fastrand::f64() * 2.0 - 1.0) * jitter;
    }

    duration_from_secs(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_without_jitter_is_exact() {
        let base = Duration::from_millis(100);
        assert_eq!(calculate_backoff(1, base, 2.0, Duration::ZERO), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, base, 2.0, Duration::ZERO), Duration::from_millis(200));
        assert_eq!(calculate_backoff(4, base, 2.0, Duration::ZERO), Duration::from_millis(800));
        assert_eq!(calculate_backoff(0, base, 2.0, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let base = Duration::from_millis(100);
        let jitter = Duration::from_millis(50);
        for _ in 0..200 {
            let d = calculate_backoff(1, base, 2.0, jitter);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150), "{d:?}");
        }
    }

    #[test]
    fn test_jitter_clamps_at_zero() {
        for _ in 0..200 {
            let d = calculate_backoff(1, Duration::ZERO, 2.0, Duration::from_millis(10));
            assert!(d <= Duration::from_millis(10));
        }
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let d = calculate_backoff(u32::MAX, Duration::from_secs(1), 2.0, Duration::ZERO);
        assert_eq!(d, Duration::MAX);
    }
}
