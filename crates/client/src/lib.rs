//! Resilient network client
//!
//! Four cooperating components over a pluggable [`Transport`]:
//!
//! - [`ConnectionPool`]: bounded per-host connection reuse with FIFO waiters
//! - [`CircuitBreaker`]: fail fast after consecutive or windowed failures
//! - [`RetryManager`]: backoff policies under a shared retry budget
//! - [`RequestBatcher`]: priority queues, coalescing of identical reads and
//!   batched delivery
//!
//! [`ResilientClient`] wires them together on one [`EventBus`].

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod batcher;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod pool;
pub mod retry;
pub mod transport;

pub use batcher::{
    BatchEnvelope, BatchRequestItem, BatchResponseEnvelope, BatchResponseItem, BatchSender,
    BatcherConfig, BatcherStats, Compressor, PooledBatchSender, RequestBatcher,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use client::{ClientStats, ResilientClient, ResilientClientBuilder};
pub use config::ClientConfig;
pub use error::{ErrorKind, NetError, NetResult};
pub use events::{EventBus, NetEvent};
pub use pool::{
    Connection, ConnectionInfo, ConnectionPool, ConnectionPoolBuilder, ConnectionState, HostStats,
    PoolConfig, PoolStats,
};
pub use retry::{
    ExponentialBackoff, FixedDelay, LinearBackoff, NoRetry, RetryBudget, RetryConfig,
    RetryManager, RetryOutcome, RetryPolicy, RetryStats,
};
pub use transport::{
    Endpoint, HttpTransport, Method, OutboundRequest, RequestBody, RequestOptions, Response,
    Transport, TransportHandle, TransportKind,
};
