//! Shared error foundation for synclink crates
//!
//! Module-specific errors compose [`CommonError`] instead of duplicating the
//! generic patterns (configuration, timeouts, serialization, lock
//! contention). Every error type in the workspace also implements
//! [`ErrorClassification`] so retry and monitoring code can reason about
//! failures without matching on concrete variants.
//!
//! ```rust,ignore
//! #[derive(Debug, thiserror::Error)]
//! pub enum PoolError {
//!     #[error("pool exhausted for {0}")]
//!     Exhausted(String),
//!
//!     #[error(transparent)]
//!     Common(#[from] CommonError),
//! }
//!
//! impl_error_classification!(PoolError, Common,
//!     Self::Exhausted(_) => {
//!         retryable: true,
//!         severity: ErrorSeverity::Warning,
//!         critical: false,
//!     }
//! );
//! ```

use std::fmt;
use std::time::Duration;

/// Standard result type using CommonError
pub type CommonResult<T> = Result<T, CommonError>;

/// Error variants shared by every synclink module
#[derive(Debug, Clone, PartialEq)]
pub enum CommonError {
    /// Configuration-related errors
    Config { message: String, field: Option<String> },

    /// Lock acquisition or concurrency errors
    Lock { message: String, resource: Option<String> },

    /// Timeout errors
    Timeout { operation: String, duration: Duration },

    /// Network or backend connectivity errors
    Backend { service: String, message: String, is_retryable: bool },

    /// Serialization or deserialization errors
    Serialization { message: String, format: Option<String> },

    /// Validation errors
    Validation { field: String, message: String, value: Option<String> },

    /// Internal errors that shouldn't normally occur
    Internal { message: String, context: Option<String> },
}

impl fmt::Display for CommonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { message, field } => match field {
                Some(field) => write!(f, "Configuration error in field '{}': {}", field, message),
                None => write!(f, "Configuration error: {}", message),
            },
            Self::Lock { message, resource } => match resource {
                Some(resource) => write!(f, "Lock error for '{}': {}", resource, message),
                None => write!(f, "Lock error: {}", message),
            },
            Self::Timeout { operation, duration } => {
                write!(f, "Operation '{}' timed out after {:?}", operation, duration)
            }
            Self::Backend { service, message, .. } => {
                write!(f, "Backend error from '{}': {}", service, message)
            }
            Self::Serialization { message, format } => match format {
                Some(format) => write!(f, "Serialization error ({}): {}", format, message),
                None => write!(f, "Serialization error: {}", message),
            },
            Self::Validation { field, message, value } => match value {
                Some(value) => write!(
                    f,
                    "Validation error for field '{}' (value: '{}'): {}",
                    field, value, message
                ),
                None => write!(f, "Validation error for field '{}': {}", field, message),
            },
            Self::Internal { message, context } => match context {
                Some(ctx) => write!(f, "Internal error in '{}': {}", ctx, message),
                None => write!(f, "Internal error: {}", message),
            },
        }
    }
}

impl std::error::Error for CommonError {}

impl ErrorClassification for CommonError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Lock { .. } => true,
            Self::Backend { is_retryable, .. } => *is_retryable,
            _ => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Lock { .. } | Self::Timeout { .. } => ErrorSeverity::Warning,
            Self::Config { .. }
            | Self::Backend { .. }
            | Self::Serialization { .. }
            | Self::Validation { .. } => ErrorSeverity::Error,
            Self::Internal { .. } => ErrorSeverity::Critical,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl CommonError {
    /// Create a simple configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), field: None }
    }

    /// Create a configuration error for a specific field
    pub fn config_field<S: Into<String>, F: Into<String>>(field: F, message: S) -> Self {
        Self::Config { message: message.into(), field: Some(field.into()) }
    }

    /// Create a simple lock error
    pub fn lock<S: Into<String>>(message: S) -> Self {
        Self::Lock { message: message.into(), resource: None }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, duration: Duration) -> Self {
        Self::Timeout { operation: operation.into(), duration }
    }

    /// Create a backend error
    pub fn backend<S: Into<String>, M: Into<String>>(
        service: S,
        message: M,
        is_retryable: bool,
    ) -> Self {
        Self::Backend { service: service.into(), message: message.into(), is_retryable }
    }

    /// Create a simple serialization error
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization { message: message.into(), format: None }
    }

    /// Create a serialization error with format information
    pub fn serialization_format<S: Into<String>, F: Into<String>>(format: F, message: S) -> Self {
        Self::Serialization { message: message.into(), format: Some(format.into()) }
    }

    /// Create a validation error
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Validation { field: field.into(), message: message.into(), value: None }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into(), context: None }
    }

    /// Create an internal error tagged with the component that raised it
    pub fn internal_in<S: Into<String>, C: Into<String>>(context: C, message: S) -> Self {
        Self::Internal { message: message.into(), context: Some(context.into()) }
    }
}

/// Classification interface implemented by every error in the workspace
pub trait ErrorClassification {
    /// Whether repeating the failed operation may succeed
    fn is_retryable(&self) -> bool;

    /// Severity used for monitoring and log levels
    fn severity(&self) -> ErrorSeverity;

    /// Whether the error signals a broken invariant
    fn is_critical(&self) -> bool;

    /// Suggested delay before retrying, when the error carries one
    fn retry_after(&self) -> Option<Duration>;
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl From<serde_json::Error> for CommonError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_format("JSON", err.to_string())
    }
}

impl From<toml::de::Error> for CommonError {
    fn from(err: toml::de::Error) -> Self {
        Self::serialization_format("TOML", err.to_string())
    }
}

impl From<std::io::Error> for CommonError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal { message: err.to_string(), context: Some("io".to_string()) }
    }
}

/// Generate `From` conversions for std/serde errors routed through
/// [`CommonError`].
///
/// ```rust,ignore
/// impl_error_conversion!(NetError, Common);
/// ```
#[macro_export]
macro_rules! impl_error_conversion {
    ($error_type:ty, $variant:ident) => {
        impl From<serde_json::Error> for $error_type {
            fn from(err: serde_json::Error) -> Self {
                Self::$variant($crate::error::CommonError::from(err))
            }
        }

        impl From<std::io::Error> for $error_type {
            fn from(err: std::io::Error) -> Self {
                Self::$variant($crate::error::CommonError::from(err))
            }
        }
    };
}

/// Implement [`ErrorClassification`] by delegating the embedded
/// `CommonError` variant and listing the module-specific ones.
///
/// Each arm is a pattern followed by `retryable`, `severity`, `critical` and
/// an optional `retry_after` expression. Patterns may bind fields and use
/// them in the expressions.
#[macro_export]
macro_rules! impl_error_classification {
    (
        $error_type:ty,
        $common_variant:ident
        $(,
            $variant:pat => {
                retryable: $retryable:expr,
                severity: $severity:expr,
                critical: $critical:expr
                $(, retry_after: $retry_after:expr)?
                $(,)?
            }
        )*
        $(,)?
    ) => {
        impl $crate::error::ErrorClassification for $error_type {
            #[allow(unused_variables)]
            fn is_retryable(&self) -> bool {
                match self {
                    Self::$common_variant(e) => $crate::error::ErrorClassification::is_retryable(e),
                    $(
                        $variant => $retryable,
                    )*
                }
            }

            #[allow(unused_variables)]
            fn severity(&self) -> $crate::error::ErrorSeverity {
                match self {
                    Self::$common_variant(e) => $crate::error::ErrorClassification::severity(e),
                    $(
                        $variant => $severity,
                    )*
                }
            }

            #[allow(unused_variables)]
            fn is_critical(&self) -> bool {
                match self {
                    Self::$common_variant(e) => $crate::error::ErrorClassification::is_critical(e),
                    $(
                        $variant => $critical,
                    )*
                }
            }

            #[allow(unused_variables)]
            fn retry_after(&self) -> Option<std::time::Duration> {
                match self {
                    Self::$common_variant(e) => $crate::error::ErrorClassification::retry_after(e),
                    $(
                        $(
                            $variant => $retry_after,
                        )?
                    )*
                    #[allow(unreachable_patterns)]
                    _ => None,
                }
            }
        }
    };
}
