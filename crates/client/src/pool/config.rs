use std::time::Duration;

use serde::{Deserialize, Serialize};
use synclink_common::error::{CommonError, CommonResult};
use synclink_common::{duration_millis, option_duration_millis};

/// Connection pool limits and timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on connections across all hosts, including ones being
    /// established
    pub max_connections: usize,
    pub max_connections_per_host: usize,
    /// Deadline for establishing one connection
    #[serde(with = "duration_millis")]
    pub connection_timeout: Duration,
    /// Idle connections unused for longer are closed
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,
    pub keep_alive: bool,
    /// With keep-alive on, connections older than this are recycled once idle
    #[serde(with = "duration_millis")]
    pub keep_alive_timeout: Duration,
    /// Period of the background sweep; zero disables it
    #[serde(with = "duration_millis")]
    pub maintenance_interval: Duration,
    /// How long `acquire` waits for a free slot; defaults to
    /// `connection_timeout`
    #[serde(with = "option_duration_millis", skip_serializing_if = "Option::is_none")]
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            max_connections_per_host: 6,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            keep_alive: true,
            keep_alive_timeout: Duration::from_secs(300),
            maintenance_interval: Duration::from_secs(30),
            acquire_timeout: None,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> CommonResult<()> {
        if self.max_connections == 0 {
            return Err(CommonError::validation("max_connections", "must be at least 1"));
        }
        if self.max_connections_per_host == 0 {
            return Err(CommonError::validation("max_connections_per_host", "must be at least 1"));
        }
        if self.max_connections_per_host > self.max_connections {
            return Err(CommonError::validation(
                "max_connections_per_host",
                format!(
                    "{} exceeds max_connections ({})",
                    self.max_connections_per_host, self.max_connections
                ),
            ));
        }
        if self.connection_timeout.is_zero() {
            return Err(CommonError::validation("connection_timeout", "must be non-zero"));
        }
        Ok(())
    }

    /// Effective wait deadline for a blocked `acquire`
    pub fn wait_timeout(&self) -> Duration {
        self.acquire_timeout.unwrap_or(self.connection_timeout)
    }
}
