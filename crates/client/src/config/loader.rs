//! Configuration loader
//!
//! Reads a [`ClientConfig`] from a TOML or JSON file, then applies
//! `SYNCLINK_*` environment overrides on top.
//!
//! ## Environment Variables
//! - `SYNCLINK_POOL_MAX_CONNECTIONS`: Global connection limit
//! - `SYNCLINK_POOL_MAX_CONNECTIONS_PER_HOST`: Per-endpoint connection limit
//! - `SYNCLINK_POOL_CONNECTION_TIMEOUT_MS`: Connect timeout in milliseconds
//! - `SYNCLINK_POOL_IDLE_TIMEOUT_MS`: Idle eviction age in milliseconds
//! - `SYNCLINK_POOL_KEEP_ALIVE`: Whether connections are kept alive
//! - `SYNCLINK_BATCH_URL`: Batch endpoint
//! - `SYNCLINK_BATCH_MAX_SIZE`: Requests per batch
//! - `SYNCLINK_BATCH_INTERVAL_MS`: Batch timer in milliseconds
//! - `SYNCLINK_BATCH_COMPRESSION`: Whether large batch bodies are gzipped
//! - `SYNCLINK_BATCH_COALESCING`: Whether identical reads are coalesced
//! - `SYNCLINK_BREAKER_FAILURE_THRESHOLD`: Consecutive failures that open
//! - `SYNCLINK_BREAKER_RESET_TIMEOUT_MS`: Open duration in milliseconds
//! - `SYNCLINK_BREAKER_CALL_TIMEOUT_MS`: Per-call timeout in milliseconds
//! - `SYNCLINK_RETRY_MAX_RETRIES`: Retries after the first attempt
//! - `SYNCLINK_RETRY_INITIAL_DELAY_MS`: First backoff delay in milliseconds
//! - `SYNCLINK_RETRY_BUDGET`: Retries allowed per budget window
//! - `SYNCLINK_LOG_LEVEL`: Fallback tracing filter when `RUST_LOG` is unset
//! - `SYNCLINK_LOG_FORMAT`: `pretty` or `json`
//!
//! ## File Locations
//! When no path is given, [`load`] probes `./synclink.toml`,
//! `./synclink.json`, then the same names next to the executable. Without a
//! file the defaults are used.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use synclink_common::error::{CommonError, CommonResult};
use synclink_common::observability::LogFormat;

use super::ClientConfig;

const FILE_NAMES: [&str; 2] = ["synclink.toml", "synclink.json"];

/// Load, override from the environment, and validate
///
/// # Errors
/// Returns `CommonError::Config` if an explicit `path` does not exist or an
/// override is malformed, `CommonError::Serialization` for an unparsable
/// file, and `CommonError::Validation` when the result is inconsistent.
pub fn load(path: Option<&Path>) -> CommonResult<ClientConfig> {
    let config = match path.map(Path::to_path_buf).or_else(probe_config_paths) {
        Some(path) => load_from_file(&path)?,
        None => {
            tracing::debug!("No config file found, using defaults");
            ClientConfig::default()
        }
    };

    let config = apply_env_overrides(config)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a file
///
/// Format is detected by extension (`.toml` or `.json`). The result is not
/// validated.
///
/// # Errors
/// Returns `CommonError::Config` if the file is missing, unreadable or has
/// an unsupported extension, and `CommonError::Serialization` if parsing
/// fails.
pub fn load_from_file(path: &Path) -> CommonResult<ClientConfig> {
    if !path.exists() {
        return Err(CommonError::config(format!("Config file not found: {}", path.display())));
    }

    tracing::info!(path = %path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(path)
        .map_err(|e| CommonError::config(format!("Failed to read config file: {e}")))?;

    parse_config(&contents, path)
}

fn parse_config(contents: &str, path: &Path) -> CommonResult<ClientConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match extension {
        "toml" => Ok(toml::from_str(contents)?),
        "json" => Ok(serde_json::from_str(contents)?),
        other => Err(CommonError::config(format!("Unsupported config format: {other}"))),
    }
}

/// First existing config file among the standard locations
pub fn probe_config_paths() -> Option<PathBuf> {
    let mut candidates = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        candidates.extend(FILE_NAMES.iter().map(|name| cwd.join(name)));
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            candidates.extend(FILE_NAMES.iter().map(|name| exe_dir.join(name)));
        }
    }

    candidates.into_iter().find(|path| path.exists())
}

/// Apply `SYNCLINK_*` variables from the process environment
///
/// # Errors
/// Returns `CommonError::Config` naming the variable when a value does not
/// parse.
pub fn apply_env_overrides(config: ClientConfig) -> CommonResult<ClientConfig> {
    apply_env_overrides_from(config, |key| std::env::var(key).ok())
}

/// Apply overrides read through `lookup` instead of the process environment
pub fn apply_env_overrides_from<F>(mut config: ClientConfig, lookup: F) -> CommonResult<ClientConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let env = Env { lookup };

    if let Some(v) = env.parse("SYNCLINK_POOL_MAX_CONNECTIONS")? {
        config.pool.max_connections = v;
    }
    if let Some(v) = env.parse("SYNCLINK_POOL_MAX_CONNECTIONS_PER_HOST")? {
        config.pool.max_connections_per_host = v;
    }
    if let Some(v) = env.millis("SYNCLINK_POOL_CONNECTION_TIMEOUT_MS")? {
        config.pool.connection_timeout = v;
    }
    if let Some(v) = env.millis("SYNCLINK_POOL_IDLE_TIMEOUT_MS")? {
        config.pool.idle_timeout = v;
    }
    if let Some(v) = env.bool("SYNCLINK_POOL_KEEP_ALIVE") {
        config.pool.keep_alive = v;
    }

    if let Some(url) = env.get("SYNCLINK_BATCH_URL") {
        config.batcher.batch_url = (!url.is_empty()).then_some(url);
    }
    if let Some(v) = env.parse("SYNCLINK_BATCH_MAX_SIZE")? {
        config.batcher.max_batch_size = v;
    }
    if let Some(v) = env.millis("SYNCLINK_BATCH_INTERVAL_MS")? {
        config.batcher.batch_interval = v;
    }
    if let Some(v) = env.bool("SYNCLINK_BATCH_COMPRESSION") {
        config.batcher.enable_compression = v;
    }
    if let Some(v) = env.bool("SYNCLINK_BATCH_COALESCING") {
        config.batcher.enable_coalescing = v;
    }

    if let Some(v) = env.parse("SYNCLINK_BREAKER_FAILURE_THRESHOLD")? {
        config.circuit_breaker.failure_threshold = v;
    }
    if let Some(v) = env.millis("SYNCLINK_BREAKER_RESET_TIMEOUT_MS")? {
        config.circuit_breaker.reset_timeout = v;
    }
    if let Some(v) = env.millis("SYNCLINK_BREAKER_CALL_TIMEOUT_MS")? {
        config.circuit_breaker.call_timeout = v;
    }

    if let Some(v) = env.parse("SYNCLINK_RETRY_MAX_RETRIES")? {
        config.retry.max_retries = v;
    }
    if let Some(v) = env.millis("SYNCLINK_RETRY_INITIAL_DELAY_MS")? {
        config.retry.initial_delay = v;
    }
    if let Some(v) = env.parse("SYNCLINK_RETRY_BUDGET")? {
        config.retry.retry_budget = v;
    }

    if let Some(level) = env.get("SYNCLINK_LOG_LEVEL") {
        config.tracing.level = level;
    }
    if let Some(format) = env.get("SYNCLINK_LOG_FORMAT") {
        config.tracing.format = match format.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            other => {
                return Err(CommonError::config_field(
                    "SYNCLINK_LOG_FORMAT",
                    format!("expected pretty or json, got {other}"),
                ))
            }
        };
    }

    Ok(config)
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string())
    }

    fn parse<T>(&self, key: &str) -> CommonResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| CommonError::config_field(key, format!("invalid value {raw:?}: {e}")))
            })
            .transpose()
    }

    fn millis(&self, key: &str) -> CommonResult<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }

    /// Accepts `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off`
    fn bool(&self, key: &str) -> Option<bool> {
        self.get(key)
            .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
    }
}
