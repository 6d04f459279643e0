// Retry budget: caps retries per rolling window across all operations
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use synclink_common::time::{Clock, SystemClock};

/// Shared counter allowing at most `budget` retries per `window`
///
/// The window restarts once `window` has elapsed since it opened, or on
/// [`RetryBudget::reset`]. Clones share the same counter.
#[derive(Debug)]
pub struct RetryBudget<C: Clock = SystemClock> {
    budget: u32,
    window: Duration,
    used: Arc<AtomicU32>,
    /// Window start, in milliseconds since `base`
    window_start_millis: Arc<AtomicU64>,
    base: Instant,
    clock: Arc<C>,
}

impl<C: Clock> Clone for RetryBudget<C> {
    fn clone(&self) -> Self {
        Self {
            budget: self.budget,
            window: self.window,
            used: Arc::clone(&self.used),
            window_start_millis: Arc::clone(&self.window_start_millis),
            base: self.base,
            clock: Arc::clone(&self.clock),
        }
    }
}

impl RetryBudget<SystemClock> {
    pub fn new(budget: u32, window: Duration) -> Self {
        Self::with_clock(budget, window, Arc::new(SystemClock))
    }
}

impl<C: Clock> RetryBudget<C> {
    /// Create a budget with a custom clock (for testing)
    pub fn with_clock(budget: u32, window: Duration, clock: Arc<C>) -> Self {
        Self {
            budget,
            window,
            used: Arc::new(AtomicU32::new(0)),
            window_start_millis: Arc::new(AtomicU64::new(0)),
            base: clock.now(),
            clock,
        }
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Consume one retry from the current window
    pub fn try_acquire(&self) -> bool {
        self.roll_window();

        loop {
            let current = self.used.load(Ordering::Acquire);
            if current >= self.budget {
                return false;
            }
            match self.used.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    /// Retries left in the current window
    pub fn remaining(&self) -> u32 {
        self.roll_window();
        self.budget.saturating_sub(self.used.load(Ordering::Acquire))
    }

    pub fn used(&self) -> u32 {
        self.roll_window();
        self.used.load(Ordering::Acquire)
    }

    /// Start a fresh window now
    pub fn reset(&self) {
        self.window_start_millis.store(self.now_millis(), Ordering::Release);
        self.used.store(0, Ordering::Release);
    }

    fn now_millis(&self) -> u64 {
        self.clock.now().saturating_duration_since(self.base).as_millis() as u64
    }

    fn roll_window(&self) {
        let now = self.now_millis();
        let start = self.window_start_millis.load(Ordering::Acquire);
        if now.saturating_sub(start) < self.window.as_millis() as u64 {
            return;
        }
        // Only the thread that moves the window start clears the counter.
        if self
            .window_start_millis
            .compare_exchange(start, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.used.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use synclink_common::time::MockClock;

    use super::*;

    /// Validates the budget is exhausted after `budget` acquisitions.
    ///
    /// Assertions:
    /// - Two acquisitions succeed, the third fails.
    /// - `remaining` tracks consumption.
    #[test]
    fn test_budget_exhaustion() {
        let clock = Arc::new(MockClock::new());
        let budget = RetryBudget::with_clock(2, Duration::from_secs(60), clock);

        assert_eq!(budget.remaining(), 2);
        assert!(budget.try_acquire());
        assert!(budget.try_acquire());
        assert!(!budget.try_acquire());
        assert_eq!(budget.remaining(), 0);
        assert_eq!(budget.used(), 2);
    }

    /// Validates the window rolls over after it elapses.
    #[test]
    fn test_window_rollover() {
        let clock = Arc::new(MockClock::new());
        let budget = RetryBudget::with_clock(1, Duration::from_secs(60), Arc::clone(&clock));

        assert!(budget.try_acquire());
        clock.advance(Duration::from_secs(59));
        assert!(!budget.try_acquire());

        clock.advance(Duration::from_secs(1));
        assert!(budget.try_acquire());
    }

    /// Validates explicit reset restores the full budget.
    #[test]
    fn test_reset() {
        let clock = Arc::new(MockClock::new());
        let budget = RetryBudget::with_clock(3, Duration::from_secs(60), clock);

        assert!(budget.try_acquire());
        assert!(budget.try_acquire());
        budget.reset();

        assert_eq!(budget.remaining(), 3);
    }

    /// Validates clones share consumption.
    #[test]
    fn test_clones_share_counter() {
        let budget = RetryBudget::new(2, Duration::from_secs(60));
        let other = budget.clone();

        assert!(budget.try_acquire());
        assert!(other.try_acquire());
        assert!(!budget.try_acquire());
    }

    /// Validates a budget over any clock clones into a handle on the same
    /// window, without the clock itself being `Clone`.
    #[test]
    fn test_generic_clone_shares_window() {
        fn share<C: Clock>(budget: &RetryBudget<C>) -> RetryBudget<C> {
            budget.clone()
        }

        let clock = Arc::new(MockClock::new());
        let budget = RetryBudget::with_clock(1, Duration::from_secs(60), Arc::clone(&clock));
        let other = share(&budget);

        assert!(other.try_acquire());
        assert!(!budget.try_acquire());

        clock.advance(Duration::from_secs(60));
        assert!(budget.try_acquire());
        assert_eq!(other.remaining(), 0);
    }

    /// Validates a zero budget never admits a retry.
    #[test]
    fn test_zero_budget() {
        let budget = RetryBudget::new(0, Duration::from_secs(60));
        assert!(!budget.try_acquire());
    }
}
