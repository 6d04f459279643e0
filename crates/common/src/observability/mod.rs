//! Tracing bootstrap
//!
//! Library code only emits `tracing` events; binaries and test harnesses
//! call [`init_tracing`] once to install a subscriber. `RUST_LOG` wins over
//! the configured level when set.

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{CommonError, CommonResult};

/// Output format of the installed subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Subscriber settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Filter directive used when `RUST_LOG` is unset (e.g. `info`,
    /// `synclink_client=debug`)
    pub level: String,
    pub format: LogFormat,
    /// Include the event target (module path) in pretty output
    pub with_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty, with_target: true }
    }
}

/// Install the global subscriber
///
/// # Errors
///
/// Returns `CommonError::Config` for an unparsable level directive, and
/// `CommonError::Internal` when a global subscriber is already installed.
pub fn init_tracing(config: &TracingConfig) -> CommonResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| CommonError::config_field("level", e.to_string()))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Json => {
            registry.with(fmt::layer().json().with_writer(std::io::stderr)).try_init()
        }
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(config.with_target).with_writer(std::io::stderr))
            .try_init(),
    };

    installed.map_err(|e| CommonError::internal_in("observability", e.to_string()))?;
    tracing::debug!(format = ?config.format, "tracing subscriber installed");
    Ok(())
}
