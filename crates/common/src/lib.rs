//! Common foundation shared across synclink crates.
//!
//! # Feature Tiers
//!
//! - `foundation`: error taxonomy and serde helpers, no side effects
//! - `runtime`: clock abstraction (tokio-backed) and tracing bootstrap

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod error;
#[cfg(feature = "foundation")]
pub mod utils;

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod observability;
#[cfg(feature = "runtime")]
pub mod time;

#[cfg(feature = "foundation")]
pub use error::{CommonError, CommonResult, ErrorClassification, ErrorSeverity};
#[cfg(feature = "runtime")]
pub use observability::{init_tracing, LogFormat, TracingConfig};
#[cfg(feature = "runtime")]
pub use time::{Clock, MockClock, SystemClock};
#[cfg(feature = "foundation")]
pub use utils::{duration_millis, option_duration_millis};
