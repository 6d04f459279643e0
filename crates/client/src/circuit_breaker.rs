//! Circuit breaker with a rolling outcome window
//!
//! The breaker wraps arbitrary async operations and fails fast while the
//! protected dependency is unhealthy.
//!
//! - `Closed`: calls run. The circuit opens once the rolling window holds at
//!   least `volume_threshold` calls and either `failure_threshold`
//!   consecutive failures occurred or the windowed error rate reached
//!   `error_threshold_percentage`.
//! - `Open`: calls are rejected with [`NetError::CircuitOpen`] until
//!   `reset_timeout` has elapsed since opening.
//! - `HalfOpen`: one trial call at a time. `success_threshold` consecutive
//!   successes close the circuit, any failure re-opens it.
//!
//! Every executed call runs under `call_timeout`; a timeout counts as a
//! failure.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use synclink_common::duration_millis;
use synclink_common::error::{CommonError, CommonResult};
use synclink_common::time::{Clock, SystemClock};
use tracing::{debug, info, instrument, warn};

use crate::error::{NetError, NetResult};
use crate::events::{EventBus, NetEvent};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow through
    Closed,
    /// Calls are rejected
    Open,
    /// A single trial call probes recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before a trial is admitted
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// Upper bound on a single protected call
    #[serde(with = "duration_millis")]
    pub call_timeout: Duration,
    /// Minimum calls in the window before the circuit may open
    pub volume_threshold: u32,
    /// Windowed error rate (0-100) that opens the circuit
    pub error_threshold_percentage: f64,
    /// Age limit of outcomes kept for the error rate
    #[serde(with = "duration_millis")]
    pub rolling_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 2,
            call_timeout: Duration::from_secs(10),
            volume_threshold: 10,
            error_threshold_percentage: 50.0,
            rolling_window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> CommonResult<()> {
        if self.failure_threshold == 0 {
            return Err(CommonError::config_field(
                "failure_threshold",
                "must be greater than 0",
            ));
        }
        if self.success_threshold == 0 {
            return Err(CommonError::config_field(
                "success_threshold",
                "must be greater than 0",
            ));
        }
        if !(self.error_threshold_percentage > 0.0 && self.error_threshold_percentage <= 100.0) {
            return Err(CommonError::config_field(
                "error_threshold_percentage",
                "must be within (0, 100]",
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(CommonError::config_field("call_timeout", "must be non-zero"));
        }
        if self.rolling_window.is_zero() {
            return Err(CommonError::config_field("rolling_window", "must be non-zero"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn volume_threshold(mut self, volume: u32) -> Self {
        self.config.volume_threshold = volume;
        self
    }

    pub fn error_threshold_percentage(mut self, percentage: f64) -> Self {
        self.config.error_threshold_percentage = percentage;
        self
    }

    pub fn rolling_window(mut self, window: Duration) -> Self {
        self.config.rolling_window = window;
        self
    }

    pub fn build(self) -> CommonResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Read-only snapshot of breaker health
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Calls currently inside the rolling window
    pub window_volume: usize,
    /// Failed share of the window, 0-100
    pub error_rate: f64,
    pub average_response_ms: f64,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub next_attempt: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    success: bool,
    duration: Duration,
    at: Instant,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    window: VecDeque<CallRecord>,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    next_attempt: Option<Instant>,
    trial_in_flight: bool,
    total_calls: u64,
    rejected_calls: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            window: VecDeque::new(),
            last_failure: None,
            last_success: None,
            next_attempt: None,
            trial_in_flight: false,
            total_calls: 0,
            rejected_calls: 0,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.window.front() {
            if now.saturating_duration_since(oldest.at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|r| !r.success).count();
        failures as f64 * 100.0 / self.window.len() as f64
    }

    fn average_response_ms(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let total: Duration = self.window.iter().map(|r| r.duration).sum();
        total.as_secs_f64() * 1000.0 / self.window.len() as f64
    }
}

type Transition = (CircuitState, CircuitState);

/// Admission ticket for one protected call
///
/// Dropping an unsettled trial permit (the caller's future was cancelled)
/// frees the half-open slot so the breaker cannot wedge.
struct Permit<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    trial: bool,
    settled: bool,
}

impl<C: Clock> Drop for Permit<'_, C> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

/// Failure-rate based circuit breaker
///
/// Cloning yields a handle to the same breaker state.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
    clock: Arc<C>,
    events: EventBus,
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
            clock: Arc::clone(&self.clock),
            events: self.events.clone(),
        }
    }
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker<SystemClock> {
    pub fn new(config: CircuitBreakerConfig) -> CommonResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker reading time from `clock` (useful for testing)
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> CommonResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Arc::new(Mutex::new(BreakerState::new())),
            clock: Arc::new(clock),
            events: EventBus::default(),
        })
    }

    /// Publish state changes on `events` instead of a private bus
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without applying the open → half-open transition
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call issued now would be admitted
    pub fn is_available(&self) -> bool {
        let now = self.clock.now();
        let st = self.inner.lock();
        match st.state {
            CircuitState::Closed => true,
            CircuitState::Open => st.next_attempt.map_or(true, |next| now >= next),
            CircuitState::HalfOpen => !st.trial_in_flight,
        }
    }

    /// Run `operation` under breaker protection
    ///
    /// # Errors
    ///
    /// - [`NetError::CircuitOpen`] when the circuit rejects the call; the
    ///   operation is not invoked.
    /// - [`NetError::OperationTimeout`] when the call exceeds `call_timeout`.
    /// - The operation's own error otherwise.
    #[instrument(skip(self, operation), fields(state = %self.state()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> NetResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<NetError>,
    {
        let permit = self.admit()?;
        let started = self.clock.now();

        let outcome = tokio::time::timeout(self.config.call_timeout, operation()).await;
        let elapsed = self.clock.now().saturating_duration_since(started);

        match outcome {
            Ok(Ok(value)) => {
                self.settle(permit, true, elapsed);
                Ok(value)
            }
            Ok(Err(error)) => {
                let error = error.into();
                debug!(error = %error, "protected call failed");
                self.settle(permit, false, elapsed);
                Err(error)
            }
            Err(_) => {
                warn!(timeout = ?self.config.call_timeout, "protected call timed out");
                self.settle(permit, false, elapsed);
                Err(NetError::OperationTimeout { timeout: self.config.call_timeout })
            }
        }
    }

    fn admit(&self) -> NetResult<Permit<'_, C>> {
        let now = self.clock.now();
        let (trial, transition) = {
            let mut st = self.inner.lock();
            let admitted = match st.state {
                CircuitState::Closed => (false, None),
                CircuitState::Open => {
                    let next = st.next_attempt.unwrap_or(now);
                    if now < next {
                        st.rejected_calls += 1;
                        return Err(self.open_error(next, now));
                    }
                    let transition = self.transition(&mut st, CircuitState::HalfOpen, now);
                    st.trial_in_flight = true;
                    (true, Some(transition))
                }
                CircuitState::HalfOpen => {
                    if st.trial_in_flight {
                        st.rejected_calls += 1;
                        let next = st.next_attempt.unwrap_or(now);
                        return Err(self.open_error(next, now));
                    }
                    st.trial_in_flight = true;
                    (true, None)
                }
            };
            st.total_calls += 1;
            admitted
        };

        if let Some((from, to)) = transition {
            self.events.emit(NetEvent::StateChange { from, to });
        }
        Ok(Permit { breaker: self, trial, settled: false })
    }

    fn settle(&self, mut permit: Permit<'_, C>, success: bool, duration: Duration) {
        permit.settled = true;
        let now = self.clock.now();
        let wall = DateTime::<Utc>::from(self.clock.system_time());

        let transition = {
            let mut st = self.inner.lock();
            if permit.trial {
                st.trial_in_flight = false;
            }
            st.window.push_back(CallRecord { success, duration, at: now });
            st.prune(now, self.config.rolling_window);

            // A call admitted while closed that finishes after the circuit
            // left Closed is recorded but never drives a transition.
            let stale = !permit.trial && st.state != CircuitState::Closed;

            if stale {
                if success {
                    st.last_success = Some(wall);
                } else {
                    st.last_failure = Some(wall);
                }
                debug!(success, state = %st.state, "late outcome from a closed-era call ignored");
                None
            } else if success {
                st.last_success = Some(wall);
                st.consecutive_failures = 0;
                st.consecutive_successes += 1;
                if st.state == CircuitState::HalfOpen
                    && st.consecutive_successes >= self.config.success_threshold
                {
                    Some(self.transition(&mut st, CircuitState::Closed, now))
                } else {
                    None
                }
            } else {
                st.last_failure = Some(wall);
                st.consecutive_successes = 0;
                st.consecutive_failures += 1;
                match st.state {
                    CircuitState::HalfOpen => {
                        Some(self.transition(&mut st, CircuitState::Open, now))
                    }
                    CircuitState::Closed if self.should_open(&st) => {
                        Some(self.transition(&mut st, CircuitState::Open, now))
                    }
                    _ => None,
                }
            }
        };

        if let Some((from, to)) = transition {
            self.events.emit(NetEvent::StateChange { from, to });
        }
    }

    fn should_open(&self, st: &BreakerState) -> bool {
        let volume_reached = st.window.len() >= self.config.volume_threshold as usize;
        let consecutive = st.consecutive_failures >= self.config.failure_threshold;
        let rate = st.error_rate() >= self.config.error_threshold_percentage;
        volume_reached && (consecutive || rate)
    }

    fn transition(&self, st: &mut BreakerState, to: CircuitState, now: Instant) -> Transition {
        let from = st.state;
        st.state = to;
        match to {
            CircuitState::Open => {
                st.next_attempt = Some(now + self.config.reset_timeout);
                st.consecutive_successes = 0;
                warn!(
                    from = %from,
                    consecutive_failures = st.consecutive_failures,
                    error_rate = st.error_rate(),
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                st.consecutive_successes = 0;
                info!("circuit half-open, admitting trial call");
            }
            CircuitState::Closed => {
                st.consecutive_failures = 0;
                st.consecutive_successes = 0;
                st.window.clear();
                st.next_attempt = None;
                st.trial_in_flight = false;
                info!(from = %from, "circuit closed");
            }
        }
        (from, to)
    }

    fn open_error(&self, next: Instant, now: Instant) -> NetError {
        let retry_after = next.saturating_duration_since(now);
        NetError::CircuitOpen {
            retry_after,
            next_attempt: DateTime::<Utc>::from(self.clock.system_time() + retry_after),
        }
    }

    /// Close the circuit and forget all recorded outcomes
    pub fn reset(&self) {
        let now = self.clock.now();
        let transition = {
            let mut st = self.inner.lock();
            let transition = (st.state != CircuitState::Closed)
                .then(|| self.transition(&mut st, CircuitState::Closed, now));
            st.window.clear();
            st.consecutive_failures = 0;
            st.consecutive_successes = 0;
            transition
        };
        if let Some((from, to)) = transition {
            self.events.emit(NetEvent::StateChange { from, to });
        }
    }

    /// Open the circuit immediately, as if the failure threshold was hit
    pub fn force_open(&self) {
        let now = self.clock.now();
        let (from, to) = {
            let mut st = self.inner.lock();
            self.transition(&mut st, CircuitState::Open, now)
        };
        if from != to {
            self.events.emit(NetEvent::StateChange { from, to });
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let now = self.clock.now();
        let wall = self.clock.system_time();
        let mut st = self.inner.lock();
        st.prune(now, self.config.rolling_window);

        CircuitBreakerStats {
            state: st.state,
            consecutive_failures: st.consecutive_failures,
            consecutive_successes: st.consecutive_successes,
            window_volume: st.window.len(),
            error_rate: st.error_rate(),
            average_response_ms: st.average_response_ms(),
            total_calls: st.total_calls,
            rejected_calls: st.rejected_calls,
            last_failure: st.last_failure,
            last_success: st.last_success,
            next_attempt: st
                .next_attempt
                .map(|next| DateTime::<Utc>::from(wall + next.saturating_duration_since(now))),
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the circuit breaker state machine
    //!
    //! Time is driven by `MockClock` so reset timeouts elapse instantly.

    use synclink_common::time::MockClock;

    use super::*;

    fn breaker(clock: &MockClock) -> CircuitBreaker<MockClock> {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(3)
            .volume_threshold(3)
            .success_threshold(2)
            .reset_timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        CircuitBreaker::with_clock(config, clock.clone()).unwrap()
    }

    async fn fail(breaker: &CircuitBreaker<MockClock>) -> NetResult<()> {
        breaker.execute(|| async { Err::<(), _>(NetError::transport("boom", Some(503))) }).await
    }

    async fn succeed(breaker: &CircuitBreaker<MockClock>) -> NetResult<u32> {
        breaker.execute(|| async { Ok::<_, NetError>(7) }).await
    }

    /// Validates default values and their validation.
    #[test]
    fn test_config_defaults() {
        let config = CircuitBreakerConfig::default();

        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout, Duration::from_secs(60));
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.call_timeout, Duration::from_secs(10));
        assert_eq!(config.volume_threshold, 10);
        assert!((config.error_threshold_percentage - 50.0).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    /// Validates the builder rejects impossible thresholds.
    ///
    /// Assertions:
    /// - Zero failure threshold is rejected.
    /// - Error percentage above 100 is rejected.
    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::builder().failure_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().success_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().error_threshold_percentage(150.0).build().is_err());
        assert!(CircuitBreakerConfig::builder().call_timeout(Duration::ZERO).build().is_err());
    }

    /// Validates `CircuitState` display strings.
    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }

    /// Validates the circuit opens after consecutive failures once the volume
    /// threshold is met.
    ///
    /// Assertions:
    /// - Two failures keep the circuit closed (volume 2 < 3).
    /// - The third failure opens it.
    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let clock = MockClock::new();
        let breaker = breaker(&clock);

        assert!(fail(&breaker).await.is_err());
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    /// Validates the volume threshold gates opening even at a 100% error
    /// rate.
    #[tokio::test]
    async fn test_volume_threshold_gates_opening() {
        let clock = MockClock::new();
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .volume_threshold(5)
            .build()
            .unwrap();
        let breaker = CircuitBreaker::with_clock(config, clock).unwrap();

        for _ in 0..4 {
            assert!(fail(&breaker).await.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    /// Validates the windowed error rate opens the circuit without a
    /// consecutive streak.
    ///
    /// Assertions:
    /// - Alternating success/failure at 50% reaches the threshold once four
    ///   calls are recorded.
    #[tokio::test]
    async fn test_error_rate_opens_circuit() {
        let clock = MockClock::new();
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(10)
            .volume_threshold(4)
            .error_threshold_percentage(50.0)
            .build()
            .unwrap();
        let breaker = CircuitBreaker::with_clock(config, clock).unwrap();

        succeed(&breaker).await.unwrap();
        assert!(fail(&breaker).await.is_err());
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    /// Validates that outcomes older than the rolling window stop counting.
    #[tokio::test]
    async fn test_rolling_window_prunes_old_outcomes() {
        let clock = MockClock::new();
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(3)
            .volume_threshold(3)
            .rolling_window(Duration::from_secs(10))
            .build()
            .unwrap();
        let breaker = CircuitBreaker::with_clock(config, clock.clone()).unwrap();

        assert!(fail(&breaker).await.is_err());
        assert!(fail(&breaker).await.is_err());
        clock.advance(Duration::from_secs(11));

        assert_eq!(breaker.stats().window_volume, 0);
        assert!(fail(&breaker).await.is_err());
        // Three consecutive failures, but only one inside the window.
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    /// Validates an open circuit rejects without invoking the operation.
    ///
    /// Assertions:
    /// - The error is `CircuitOpen` with a positive retry hint.
    /// - The operation closure never runs.
    #[tokio::test]
    async fn test_open_rejects_without_invoking() {
        let clock = MockClock::new();
        let breaker = breaker(&clock);
        breaker.force_open();

        let mut invoked = false;
        let result = breaker
            .execute(|| {
                invoked = true;
                async { Ok::<_, NetError>(()) }
            })
            .await;

        assert!(!invoked);
        match result {
            Err(NetError::CircuitOpen { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(30));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        assert_eq!(breaker.stats().rejected_calls, 1);
    }

    /// Validates open → half-open → closed recovery.
    ///
    /// Assertions:
    /// - The first call after `reset_timeout` moves the circuit to half-open.
    /// - `success_threshold` successes close it and clear the counters.
    #[tokio::test]
    async fn test_half_open_recovers_after_successes() {
        let clock = MockClock::new();
        let breaker = breaker(&clock);
        breaker.force_open();

        clock.advance(Duration::from_secs(29));
        assert!(matches!(succeed(&breaker).await, Err(NetError::CircuitOpen { .. })));

        clock.advance(Duration::from_secs(1));
        assert!(breaker.is_available());
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);

        let stats = breaker.stats();
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.window_volume, 0);
        assert_eq!(stats.next_attempt, None);
    }

    /// Validates a failed trial re-opens the circuit and pushes back the next
    /// attempt.
    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let clock = MockClock::new();
        let breaker = breaker(&clock);
        breaker.force_open();
        clock.advance(Duration::from_secs(30));

        assert!(matches!(fail(&breaker).await, Err(NetError::Transport { .. })));
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(29));
        assert!(!breaker.is_available());
    }

    /// Validates that only one half-open trial runs at a time.
    ///
    /// Assertions:
    /// - A second call while the trial is pending is rejected.
    /// - The trial itself completes normally.
    #[tokio::test]
    async fn test_half_open_admits_single_trial() {
        let clock = MockClock::new();
        let breaker = breaker(&clock);
        breaker.force_open();
        clock.advance(Duration::from_secs(30));

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_breaker = breaker.clone();
        let trial = tokio::spawn(async move {
            trial_breaker
                .execute(|| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, NetError>("trial")
                })
                .await
        });

        started_rx.await.unwrap();
        assert!(matches!(succeed(&breaker).await, Err(NetError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), "trial");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    /// Validates a cancelled trial frees the half-open slot.
    #[tokio::test]
    async fn test_cancelled_trial_releases_slot() {
        let clock = MockClock::new();
        let breaker = breaker(&clock);
        breaker.force_open();
        clock.advance(Duration::from_secs(30));

        let pending = breaker.execute(|| std::future::pending::<Result<(), NetError>>());
        let mut pending = tokio_test::task::spawn(pending);
        assert!(pending.poll().is_pending());
        drop(pending);

        assert!(breaker.is_available());
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
    }

    /// Validates the call timeout converts slow calls into failures.
    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_counts_as_failure() {
        let config = CircuitBreakerConfig::builder()
            .call_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let breaker = CircuitBreaker::new(config).unwrap();

        let result = breaker
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, NetError>(())
            })
            .await;

        assert!(matches!(result, Err(NetError::OperationTimeout { .. })));
        assert_eq!(breaker.stats().consecutive_failures, 1);
    }

    /// Validates state changes are published on the shared bus.
    #[tokio::test]
    async fn test_state_change_events() {
        let clock = MockClock::new();
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let breaker = breaker(&clock).with_events(events);

        breaker.force_open();
        breaker.reset();

        assert_eq!(
            rx.recv().await.unwrap(),
            NetEvent::StateChange { from: CircuitState::Closed, to: CircuitState::Open }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            NetEvent::StateChange { from: CircuitState::Open, to: CircuitState::Closed }
        );
    }

    /// Validates statistics after mixed outcomes.
    #[tokio::test]
    async fn test_stats_after_mixed_calls() {
        let clock = MockClock::new();
        let breaker = breaker(&clock);

        succeed(&breaker).await.unwrap();
        assert!(fail(&breaker).await.is_err());

        let stats = breaker.stats();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.window_volume, 2);
        assert!((stats.error_rate - 50.0).abs() < f64::EPSILON);
        assert!(stats.last_failure.is_some());
        assert!(stats.last_success.is_some());
    }
}
