//! Retry backoff policies.
//!
//! The dispatcher asks a [`BackoffPolicy`] how long a failed task must wait before
//! it becomes eligible again. The policy is a trait object so deployments and
//! tests can plug in their own curve.

use std::time::Duration;

/// Delay before a requeued task may be reassigned.
pub trait BackoffPolicy: Send + Sync + std::fmt::Debug {
    /// Delay for the retry following `retry_count` previous retries (0-indexed).
    fn delay(&self, retry_count: u32) -> Duration;
}

/// `first × factor^n`, clamped to `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(5),
            max: Duration::from_secs(300),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, retry_count: u32) -> Duration {
        let exp = retry_count.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Same delay for every retry. `FixedBackoff(Duration::ZERO)` retries immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedBackoff(pub Duration);

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, _retry_count: u32) -> Duration {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_grows_then_caps() {
        let policy = ExponentialBackoff {
            first: Duration::from_millis(100),
            max: Duration::from_secs(10),
            factor: 2.0,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(10), Duration::from_secs(10));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn factor_one_is_constant() {
        let policy = ExponentialBackoff {
            first: Duration::from_secs(2),
            max: Duration::from_secs(60),
            factor: 1.0,
        };
        assert_eq!(policy.delay(0), policy.delay(7));
    }

    #[test]
    fn fixed_ignores_attempt() {
        let policy = FixedBackoff(Duration::from_secs(3));
        assert_eq!(policy.delay(0), Duration::from_secs(3));
        assert_eq!(policy.delay(9), Duration::from_secs(3));
    }
}
