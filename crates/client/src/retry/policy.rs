// Retry policies: whether to retry and how long to wait
use std::time::Duration;

use rand::Rng;
use synclink_common::error::ErrorClassification;

use crate::error::NetError;
use crate::retry::RetryConfig;

/// Decides whether a failed attempt is repeated and how long to wait
///
/// `attempt` is the 1-based number of the attempt that just failed, so
/// `delay(1)` is the wait before the second attempt.
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, error: &NetError, attempt: u32) -> bool;

    fn delay(&self, attempt: u32) -> Duration;
}

/// Apply symmetric jitter: `delay × (1 ± fraction)`
pub fn apply_jitter(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 || delay.is_zero() {
        return delay;
    }
    let fraction = fraction.min(1.0);
    let factor = 1.0 + rand::thread_rng().gen_range(-fraction..=fraction);
    delay.mul_f64(factor.max(0.0))
}

/// Never retries
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _error: &NetError, _attempt: u32) -> bool {
        false
    }

    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Same delay before every retry
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    pub delay: Duration,
    pub max_retries: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }
}

impl RetryPolicy for FixedDelay {
    fn should_retry(&self, error: &NetError, attempt: u32) -> bool {
        attempt <= self.max_retries && error.is_retryable()
    }

    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// `min(initial × multiplier^(attempt−1), max)` with ± jitter
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random, 0 disables
    pub jitter: f64,
    pub max_retries: u32,
}

impl ExponentialBackoff {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
            max_retries: config.max_retries,
        }
    }

    /// Delay before jitter is applied
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, error: &NetError, attempt: u32) -> bool {
        attempt <= self.max_retries && error.is_retryable()
    }

    fn delay(&self, attempt: u32) -> Duration {
        apply_jitter(self.base_delay(attempt), self.jitter)
    }
}

/// `initial + increment × (attempt−1)`, capped at `max_delay`
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    pub initial_delay: Duration,
    pub increment: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl RetryPolicy for LinearBackoff {
    fn should_retry(&self, error: &NetError, attempt: u32) -> bool {
        attempt <= self.max_retries && error.is_retryable()
    }

    fn delay(&self, attempt: u32) -> Duration {
        let steps = attempt.saturating_sub(1);
        self.initial_delay.saturating_add(self.increment.saturating_mul(steps)).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retryable() -> NetError {
        NetError::transport("unavailable", Some(503))
    }

    fn exponential(jitter: f64) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter,
            max_retries: 3,
        }
    }

    /// Validates the exponential sequence and its cap.
    ///
    /// Assertions:
    /// - Delays double from the initial delay.
    /// - The fifth delay is capped at `max_delay`.
    #[test]
    fn test_exponential_backoff_sequence() {
        let policy = exponential(0.0);

        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_secs(1));
    }

    /// Validates jitter stays within the configured fraction.
    #[test]
    fn test_exponential_jitter_bounds() {
        let policy = exponential(0.1);

        for _ in 0..200 {
            let delay = policy.delay(2);
            assert!(delay >= Duration::from_millis(179), "{delay:?} below bound");
            assert!(delay <= Duration::from_millis(221), "{delay:?} above bound");
        }
    }

    /// Validates attempt limits and error classification gate retries.
    #[test]
    fn test_should_retry_limits() {
        let policy = exponential(0.0);

        assert!(policy.should_retry(&retryable(), 1));
        assert!(policy.should_retry(&retryable(), 3));
        assert!(!policy.should_retry(&retryable(), 4));
        assert!(!policy.should_retry(&NetError::transport("missing", Some(404)), 1));
    }

    /// Validates linear growth.
    #[test]
    fn test_linear_backoff() {
        let policy = LinearBackoff {
            initial_delay: Duration::from_millis(100),
            increment: Duration::from_millis(50),
            max_delay: Duration::from_millis(180),
            max_retries: 5,
        };

        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(150));
        assert_eq!(policy.delay(3), Duration::from_millis(180));
    }

    /// Validates a linear delay that overflows `Duration` saturates at the
    /// cap instead of panicking.
    #[test]
    fn test_linear_delay_saturates_at_cap() {
        let policy = LinearBackoff {
            initial_delay: Duration::MAX - Duration::from_secs(1),
            increment: Duration::MAX,
            max_delay: Duration::from_secs(30),
            max_retries: u32::MAX,
        };

        assert_eq!(policy.delay(2), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    /// Validates the fixed and no-retry policies.
    #[test]
    fn test_fixed_and_no_retry() {
        let fixed = FixedDelay::new(Duration::from_millis(250), 2);
        assert_eq!(fixed.delay(1), Duration::from_millis(250));
        assert_eq!(fixed.delay(7), Duration::from_millis(250));
        assert!(fixed.should_retry(&retryable(), 2));
        assert!(!fixed.should_retry(&retryable(), 3));

        assert!(!NoRetry.should_retry(&retryable(), 1));
        assert_eq!(NoRetry.delay(1), Duration::ZERO);
    }

    /// Validates jitter passthrough for zero delay and zero fraction.
    #[test]
    fn test_apply_jitter_passthrough() {
        assert_eq!(apply_jitter(Duration::ZERO, 0.5), Duration::ZERO);
        assert_eq!(apply_jitter(Duration::from_millis(40), 0.0), Duration::from_millis(40));
    }
}
