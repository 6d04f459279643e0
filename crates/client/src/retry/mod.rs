//! Retry orchestration
//!
//! [`RetryManager`] is the only layer in the client that re-attempts
//! operations. Each failure is checked against the deny list, then the allow
//! list, then the [`RetryPolicy`]; an accepted retry must also fit in the
//! global [`RetryBudget`] before the manager sleeps and tries again.

pub mod budget;
pub mod policy;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use synclink_common::duration_millis;
use synclink_common::error::{CommonError, CommonResult, ErrorClassification};
use synclink_common::time::{Clock, SystemClock};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

pub use self::budget::RetryBudget;
pub use self::policy::{
    apply_jitter, ExponentialBackoff, FixedDelay, LinearBackoff, NoRetry, RetryPolicy,
};
use crate::error::{ErrorKind, NetError, NetResult};
use crate::events::{EventBus, NetEvent};

/// Retry settings; the default policy is exponential backoff built from
/// these values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Random ± fraction applied to each delay
    pub jitter: f64,
    /// Retries allowed per budget window across all operations
    pub retry_budget: u32,
    #[serde(with = "duration_millis")]
    pub budget_window: Duration,
    /// When non-empty, only these error kinds are retried
    pub retry_on: Vec<ErrorKind>,
    /// Error kinds that are never retried; checked first
    pub never_retry_on: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.1,
            retry_budget: 100,
            budget_window: Duration::from_secs(60),
            retry_on: Vec::new(),
            never_retry_on: vec![ErrorKind::ShuttingDown],
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    pub fn validate(&self) -> CommonResult<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(CommonError::config_field("backoff_multiplier", "must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(CommonError::config_field("jitter", "must be within [0, 1]"));
        }
        if self.initial_delay > self.max_delay {
            return Err(CommonError::config_field(
                "initial_delay",
                "must not exceed max_delay",
            ));
        }
        if self.budget_window.is_zero() {
            return Err(CommonError::config_field("budget_window", "must be non-zero"));
        }
        Ok(())
    }
}

/// Builder for [`RetryConfig`]
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, fraction: f64) -> Self {
        self.config.jitter = fraction;
        self
    }

    pub fn no_jitter(self) -> Self {
        self.jitter(0.0)
    }

    pub fn retry_budget(mut self, budget: u32, window: Duration) -> Self {
        self.config.retry_budget = budget;
        self.config.budget_window = window;
        self
    }

    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.config.retry_on = kinds.into_iter().collect();
        self
    }

    pub fn never_retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.config.never_retry_on = kinds.into_iter().collect();
        self
    }

    pub fn build(self) -> CommonResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Result of one `execute` call plus how it got there
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: NetResult<T>,
    /// Attempts made, including the first
    pub attempts: u32,
    /// Delays slept between attempts, in order
    pub delays: Vec<Duration>,
    pub elapsed: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn into_result(self) -> NetResult<T> {
        self.result
    }

    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }
}

/// Aggregate retry statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStats {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub total_retries: u64,
    pub budget_rejections: u64,
    /// Successful share of finished operations, 0-1
    pub success_rate: f64,
    pub budget_remaining: u32,
    pub budget_used: u32,
}

#[derive(Debug, Default)]
struct RetryCounters {
    operations: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    budget_rejections: AtomicU64,
}

/// Runs operations under a retry policy and the shared retry budget
pub struct RetryManager<C: Clock = SystemClock> {
    config: RetryConfig,
    policy: Arc<dyn RetryPolicy>,
    budget: RetryBudget<C>,
    counters: Arc<RetryCounters>,
    clock: Arc<C>,
    events: EventBus,
}

impl<C: Clock> Clone for RetryManager<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            policy: Arc::clone(&self.policy),
            budget: self.budget.clone(),
            counters: Arc::clone(&self.counters),
            clock: Arc::clone(&self.clock),
            events: self.events.clone(),
        }
    }
}

impl<C: Clock> std::fmt::Debug for RetryManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("config", &self.config)
            .field("budget_remaining", &self.budget.remaining())
            .finish()
    }
}

impl RetryManager<SystemClock> {
    pub fn new(config: RetryConfig) -> CommonResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> RetryManager<C> {
    /// Create a manager whose budget window reads `clock`
    pub fn with_clock(config: RetryConfig, clock: C) -> CommonResult<Self> {
        config.validate()?;
        let clock = Arc::new(clock);
        let budget =
            RetryBudget::with_clock(config.retry_budget, config.budget_window, Arc::clone(&clock));
        Ok(Self {
            policy: Arc::new(ExponentialBackoff::from_config(&config)),
            config,
            budget,
            counters: Arc::new(RetryCounters::default()),
            clock,
            events: EventBus::default(),
        })
    }

    /// Replace the default exponential policy
    pub fn with_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn budget(&self) -> &RetryBudget<C> {
        &self.budget
    }

    /// Run `operation` with the default policy
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> NetResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<NetError>,
    {
        let policy = Arc::clone(&self.policy);
        self.run(policy.as_ref(), operation).await.into_result()
    }

    /// Run `operation` with an explicit policy for this call only
    pub async fn execute_with_policy<F, Fut, T, E>(
        &self,
        policy: &dyn RetryPolicy,
        operation: F,
    ) -> NetResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<NetError>,
    {
        self.run(policy, operation).await.into_result()
    }

    /// Run `operation` with the default policy and report attempts and delays
    pub async fn execute_with_outcome<F, Fut, T, E>(&self, operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<NetError>,
    {
        let policy = Arc::clone(&self.policy);
        self.run(policy.as_ref(), operation).await
    }

    #[instrument(skip_all, fields(operation_id = tracing::field::Empty))]
    async fn run<F, Fut, T, E>(&self, policy: &dyn RetryPolicy, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<NetError>,
    {
        let operation_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("operation_id", operation_id.as_str());
        self.counters.operations.fetch_add(1, Ordering::Relaxed);

        let started = self.clock.now();
        let mut delays = Vec::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let error = match operation().await {
                Ok(value) => {
                    self.counters.successes.fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retries");
                        self.events.emit(NetEvent::RetrySuccess {
                            operation_id: operation_id.clone(),
                            attempts: attempt,
                        });
                    }
                    return self.outcome(Ok(value), attempt, delays, started);
                }
                Err(error) => error.into(),
            };

            if !self.is_eligible(&error) || !policy.should_retry(&error, attempt) {
                let error = self.give_up(error, attempt);
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.events.emit(NetEvent::RetryFailure {
                    operation_id: operation_id.clone(),
                    attempts: attempt,
                    error: error.to_string(),
                });
                return self.outcome(Err(error), attempt, delays, started);
            }

            if !self.budget.try_acquire() {
                warn!(
                    budget = self.budget.budget(),
                    window = ?self.budget.window(),
                    "retry budget exhausted"
                );
                self.counters.budget_rejections.fetch_add(1, Ordering::Relaxed);
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.events.emit(NetEvent::BudgetExceeded {
                    operation_id: operation_id.clone(),
                    budget: self.budget.budget(),
                    window_ms: self.budget.window().as_millis() as u64,
                });
                let error = NetError::RetryBudgetExceeded {
                    budget: self.budget.budget(),
                    window: self.budget.window(),
                };
                return self.outcome(Err(error), attempt, delays, started);
            }

            let delay = policy.delay(attempt);
            warn!(attempt, delay = ?delay, error = %error, "attempt failed, retrying");
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            self.events.emit(NetEvent::RetryAttempt {
                operation_id: operation_id.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
            });

            tokio::time::sleep(delay).await;
            delays.push(delay);
        }
    }

    /// Deny list wins; a non-empty allow list must contain the kind
    fn is_eligible(&self, error: &NetError) -> bool {
        let kind = error.kind();
        if self.config.never_retry_on.contains(&kind) {
            return false;
        }
        self.config.retry_on.is_empty() || self.config.retry_on.contains(&kind)
    }

    /// A retryable failure that ran out of attempts becomes `RetryExhausted`;
    /// anything else propagates unchanged.
    fn give_up(&self, error: NetError, attempt: u32) -> NetError {
        if attempt > 1 && error.is_retryable() && self.is_eligible(&error) {
            warn!(attempts = attempt, error = %error, "retry attempts exhausted");
            NetError::RetryExhausted { attempts: attempt, last_error: Box::new(error) }
        } else {
            debug!(attempt, error = %error, "failure not retried");
            error
        }
    }

    fn outcome<T>(
        &self,
        result: NetResult<T>,
        attempts: u32,
        delays: Vec<Duration>,
        started: std::time::Instant,
    ) -> RetryOutcome<T> {
        RetryOutcome {
            result,
            attempts,
            delays,
            elapsed: self.clock.now().saturating_duration_since(started),
        }
    }

    /// Restore the full retry budget immediately
    pub fn reset_budget(&self) {
        self.budget.reset();
    }

    pub fn stats(&self) -> RetryStats {
        let successes = self.counters.successes.load(Ordering::Relaxed);
        let failures = self.counters.failures.load(Ordering::Relaxed);
        let finished = successes + failures;
        RetryStats {
            total_operations: self.counters.operations.load(Ordering::Relaxed),
            successful_operations: successes,
            failed_operations: failures,
            total_retries: self.counters.retries.load(Ordering::Relaxed),
            budget_rejections: self.counters.budget_rejections.load(Ordering::Relaxed),
            success_rate: if finished == 0 { 1.0 } else { successes as f64 / finished as f64 },
            budget_remaining: self.budget.remaining(),
            budget_used: self.budget.used(),
        }
    }
}
