//! Error taxonomy for the network client
//!
//! `NetError` is `Clone` because one outcome may be delivered to several
//! callers (coalesced batch entries share a single result).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use synclink_common::error::{CommonError, ErrorSeverity};
use synclink_common::{impl_error_classification, impl_error_conversion};
use thiserror::Error;

/// Errors surfaced by the pool, breaker, retry manager and batcher
#[derive(Debug, Clone, Error)]
pub enum NetError {
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Establishing a new connection failed
    #[error("failed to connect to {endpoint}: {message}")]
    ConnectionFailed { endpoint: String, message: String },

    /// No connection became available before the wait deadline
    #[error("timed out after {waited:?} waiting for a connection to {endpoint}")]
    ConnectionWaitTimeout { endpoint: String, waited: Duration },

    /// The circuit breaker rejected the call without running it
    #[error("circuit breaker is open, next attempt at {next_attempt}")]
    CircuitOpen { retry_after: Duration, next_attempt: DateTime<Utc> },

    /// The operation did not finish within its call timeout
    #[error("operation timed out after {timeout:?}")]
    OperationTimeout { timeout: Duration },

    /// The retry policy gave up; carries the last failure
    #[error("retry attempts exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last_error: Box<NetError>,
    },

    /// The global retry budget for the current window is spent
    #[error("retry budget of {budget} retries per {window:?} exceeded")]
    RetryBudgetExceeded { budget: u32, window: Duration },

    /// The batch network call failed as a whole
    #[error("batch dispatch failed: {message}")]
    BatchTransport { message: String, status: Option<u16> },

    /// The batch response had no entry for this request
    #[error("no response for request {request_id}")]
    NoResponse { request_id: String },

    /// A single transport call failed, with the HTTP status when one was
    /// received
    #[error("transport error: {message}")]
    Transport { message: String, status: Option<u16> },

    /// The backend answered this request of a batch with an error
    #[error("request {request_id} rejected with status {status}: {message}")]
    RequestRejected { request_id: String, status: u16, message: String },

    #[error("component is shutting down")]
    ShuttingDown,
}

/// Result alias used throughout the client crate
pub type NetResult<T> = Result<T, NetError>;

/// Variant discriminant, used by retry allow/deny lists and event payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Common,
    ConnectionFailed,
    ConnectionWaitTimeout,
    CircuitOpen,
    OperationTimeout,
    RetryExhausted,
    RetryBudgetExceeded,
    BatchTransport,
    NoResponse,
    Transport,
    RequestRejected,
    ShuttingDown,
}

/// Server errors, request timeouts, throttling and status-less failures are
/// worth repeating; other client errors are not.
pub fn status_is_retryable(status: Option<u16>) -> bool {
    match status {
        None => true,
        Some(code) => code >= 500 || code == 408 || code == 429,
    }
}

impl NetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Common(_) => ErrorKind::Common,
            Self::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Self::ConnectionWaitTimeout { .. } => ErrorKind::ConnectionWaitTimeout,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::OperationTimeout { .. } => ErrorKind::OperationTimeout,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::RetryBudgetExceeded { .. } => ErrorKind::RetryBudgetExceeded,
            Self::BatchTransport { .. } => ErrorKind::BatchTransport,
            Self::NoResponse { .. } => ErrorKind::NoResponse,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::RequestRejected { .. } => ErrorKind::RequestRejected,
            Self::ShuttingDown => ErrorKind::ShuttingDown,
        }
    }

    /// HTTP status attached to the failure, if the backend answered
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } | Self::BatchTransport { status, .. } => *status,
            Self::RequestRejected { status, .. } => Some(*status),
            Self::RetryExhausted { last_error, .. } => last_error.status(),
            _ => None,
        }
    }

    /// Innermost error, looking through `RetryExhausted` wrappers
    pub fn root_cause(&self) -> &NetError {
        match self {
            Self::RetryExhausted { last_error, .. } => last_error.root_cause(),
            other => other,
        }
    }

    pub fn transport<S: Into<String>>(message: S, status: Option<u16>) -> Self {
        Self::Transport { message: message.into(), status }
    }
}

impl_error_conversion!(NetError, Common);

impl_error_classification!(NetError, Common,
    Self::ConnectionFailed { .. } => {
        retryable: true,
        severity: ErrorSeverity::Error,
        critical: false,
    },
    Self::ConnectionWaitTimeout { .. } => {
        retryable: true,
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::CircuitOpen { retry_after, .. } => {
        retryable: true,
        severity: ErrorSeverity::Warning,
        critical: false,
        retry_after: Some(*retry_after),
    },
    Self::OperationTimeout { .. } => {
        retryable: true,
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::RetryExhausted { .. } => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
    },
    Self::RetryBudgetExceeded { .. } => {
        retryable: false,
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::BatchTransport { status, .. } => {
        retryable: status_is_retryable(*status),
        severity: ErrorSeverity::Error,
        critical: false,
    },
    Self::NoResponse { .. } => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
    },
    Self::Transport { status, .. } => {
        retryable: status_is_retryable(*status),
        severity: ErrorSeverity::Error,
        critical: false,
    },
    Self::RequestRejected { status, .. } => {
        retryable: status_is_retryable(Some(*status)),
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::ShuttingDown => {
        retryable: false,
        severity: ErrorSeverity::Info,
        critical: false,
    }
);
