//! Aggregate client configuration
//!
//! Every section has defaults, so a file only needs the keys it changes.
//! Durations are written as milliseconds.
//!
//! ```toml
//! event_capacity = 512
//!
//! [pool]
//! max_connections_per_host = 2
//!
//! [batcher]
//! batch_url = "https://api.example.com/batch"
//! batch_interval = 25
//!
//! [retry]
//! max_retries = 5
//! ```

pub mod loader;

use serde::{Deserialize, Serialize};
use synclink_common::error::{CommonError, CommonResult};
use synclink_common::observability::TracingConfig;

use crate::batcher::BatcherConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::pool::PoolConfig;
use crate::retry::RetryConfig;

pub use self::loader::{apply_env_overrides, apply_env_overrides_from, load, load_from_file};

/// Settings for a [`ResilientClient`](crate::ResilientClient)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub pool: PoolConfig,
    pub batcher: BatcherConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub tracing: TracingConfig,
    /// Events buffered per subscriber before the oldest are dropped
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            batcher: BatcherConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            tracing: TracingConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Validate every section
    ///
    /// # Errors
    ///
    /// Returns the first section error found, in declaration order.
    pub fn validate(&self) -> CommonResult<()> {
        self.pool.validate()?;
        self.batcher.validate()?;
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        if self.event_capacity == 0 {
            return Err(CommonError::validation("event_capacity", "must be at least 1"));
        }
        Ok(())
    }
}
