//! One entry point wiring pool, breaker, retry and batcher together
//!
//! Direct requests run as `retry(breaker(pool.request))`. Batched requests
//! go through the [`RequestBatcher`], whose default sender uses the same
//! pool, breaker and retry manager. Every component publishes on one
//! [`EventBus`].
//!
//! The breaker's `call_timeout` bounds the whole pooled call, including
//! the wait for a free connection. Unless `pool.acquire_timeout` is set
//! explicitly, the client caps that wait at half of `call_timeout` so a
//! saturated pool surfaces as `ConnectionWaitTimeout` rather than as a
//! breaker `OperationTimeout`. An explicit `acquire_timeout` is used as
//! given.

use std::sync::Arc;

use serde::Serialize;
use synclink_common::error::{CommonError, CommonResult};
use synclink_common::time::{Clock, SystemClock};
use tokio::sync::broadcast;
use tracing::{info, instrument};

use crate::batcher::{BatchSender, BatcherStats, PooledBatchSender, RequestBatcher};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStats};
use crate::config::ClientConfig;
use crate::error::NetResult;
use crate::events::{EventBus, NetEvent};
use crate::pool::{ConnectionPool, PoolStats};
use crate::retry::{RetryManager, RetryStats};
use crate::transport::{HttpTransport, RequestOptions, Response, Transport};

/// Snapshot of every component
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub pool: PoolStats,
    pub circuit_breaker: CircuitBreakerStats,
    pub retry: RetryStats,
    /// Absent when batching is not configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batcher: Option<BatcherStats>,
}

/// Resilient network client
///
/// Cloning yields another handle to the same components.
pub struct ResilientClient<C: Clock = SystemClock> {
    pool: ConnectionPool<C>,
    breaker: CircuitBreaker<C>,
    retry: RetryManager<C>,
    batcher: Option<RequestBatcher>,
    events: EventBus,
}

impl<C: Clock> Clone for ResilientClient<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            breaker: self.breaker.clone(),
            retry: self.retry.clone(),
            batcher: self.batcher.clone(),
            events: self.events.clone(),
        }
    }
}

impl<C: Clock> std::fmt::Debug for ResilientClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("pool", &self.pool)
            .field("breaker", &self.breaker)
            .field("batching", &self.batcher.is_some())
            .finish()
    }
}

/// Builder for [`ResilientClient`]
pub struct ResilientClientBuilder<C: Clock = SystemClock> {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    batch_sender: Option<Arc<dyn BatchSender>>,
    clock: C,
}

impl ResilientClientBuilder<SystemClock> {
    pub fn new() -> Self {
        Self { config: ClientConfig::default(), transport: None, batch_sender: None, clock: SystemClock }
    }
}

impl Default for ResilientClientBuilder<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock + Clone> ResilientClientBuilder<C> {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Transport used by the pool; defaults to [`HttpTransport`]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Custom batch delivery; enables batching even without a `batch_url`
    pub fn batch_sender(mut self, sender: Arc<dyn BatchSender>) -> Self {
        self.batch_sender = Some(sender);
        self
    }

    /// Time source shared by the pool, breaker and retry budget
    pub fn clock<C2: Clock + Clone>(self, clock: C2) -> ResilientClientBuilder<C2> {
        ResilientClientBuilder {
            config: self.config,
            transport: self.transport,
            batch_sender: self.batch_sender,
            clock,
        }
    }

    /// Validate the configuration and wire the components
    ///
    /// # Errors
    ///
    /// Returns the first configuration error found.
    pub fn build(self) -> CommonResult<ResilientClient<C>> {
        let config = self.config;
        config.validate()?;

        let events = EventBus::new(config.event_capacity);
        let transport =
            self.transport.unwrap_or_else(|| Arc::new(HttpTransport::new()) as Arc<dyn Transport>);

        let mut pool_config = config.pool.clone();
        let call_timeout = config.circuit_breaker.call_timeout;
        if pool_config.acquire_timeout.is_none() && pool_config.wait_timeout() >= call_timeout {
            pool_config.acquire_timeout = Some(call_timeout / 2);
        }

        let pool = ConnectionPool::builder(transport)
            .config(pool_config)
            .events(events.clone())
            .clock(self.clock.clone())
            .build()?;
        let breaker = CircuitBreaker::with_clock(config.circuit_breaker.clone(), self.clock.clone())?
            .with_events(events.clone());
        let retry =
            RetryManager::with_clock(config.retry.clone(), self.clock)?.with_events(events.clone());

        let sender = match (self.batch_sender, &config.batcher.batch_url) {
            (Some(sender), _) => Some(sender),
            (None, Some(url)) => {
                let sender =
                    PooledBatchSender::new(url.clone(), pool.clone(), breaker.clone(), retry.clone());
                let sender = match config.batcher.compressor() {
                    Some(compressor) => sender.with_compression(compressor),
                    None => sender,
                };
                Some(Arc::new(sender) as Arc<dyn BatchSender>)
            }
            (None, None) => None,
        };
        let batcher = sender
            .map(|sender| {
                RequestBatcher::new(config.batcher.clone(), sender)
                    .map(|batcher| batcher.with_events(events.clone()))
            })
            .transpose()?;

        info!(
            batching = batcher.is_some(),
            max_connections = config.pool.max_connections,
            "resilient client ready"
        );

        Ok(ResilientClient { pool, breaker, retry, batcher, events })
    }
}

impl ResilientClient<SystemClock> {
    pub fn builder() -> ResilientClientBuilder<SystemClock> {
        ResilientClientBuilder::new()
    }

    /// Client over [`HttpTransport`] with the given settings
    pub fn new(config: ClientConfig) -> CommonResult<Self> {
        Self::builder().config(config).build()
    }
}

impl<C: Clock> ResilientClient<C> {
    /// Send one request through retry, breaker and pool
    ///
    /// # Errors
    ///
    /// Whatever the retry manager gives up with: the last error, or
    /// `RetryExhausted` / `RetryBudgetExceeded` wrapping it.
    #[instrument(skip(self, options), fields(method = %options.method))]
    pub async fn request(&self, url: &str, options: RequestOptions) -> NetResult<Response> {
        self.retry
            .execute(|| {
                let options = options.clone();
                async move { self.breaker.execute(|| self.pool.request(url, options)).await }
            })
            .await
    }

    /// Queue a request for the next batch
    ///
    /// # Errors
    ///
    /// `CommonError::Config` when batching is not configured, otherwise the
    /// batcher's outcome for this request.
    pub async fn add_request(&self, url: &str, options: RequestOptions) -> NetResult<Response> {
        match &self.batcher {
            Some(batcher) => batcher.add_request(url, options).await,
            None => Err(CommonError::config_field(
                "batcher.batch_url",
                "batching is not configured for this client",
            )
            .into()),
        }
    }

    /// Dispatch everything queued now; returns the number of requests sent
    pub async fn flush(&self) -> usize {
        match &self.batcher {
            Some(batcher) => batcher.flush().await,
            None => 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker<C> {
        &self.breaker
    }

    pub fn retry_manager(&self) -> &RetryManager<C> {
        &self.retry
    }

    pub fn batcher(&self) -> Option<&RequestBatcher> {
        self.batcher.as_ref()
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            pool: self.pool.stats(),
            circuit_breaker: self.breaker.stats(),
            retry: self.retry.stats(),
            batcher: self.batcher.as_ref().map(RequestBatcher::stats),
        }
    }

    /// Flush and stop the batcher, then close every connection
    pub async fn shutdown(&self) {
        if let Some(batcher) = &self.batcher {
            batcher.shutdown().await;
        }
        self.pool.shutdown().await;
        info!("resilient client shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::error::NetError;
    use crate::transport::{Endpoint, OutboundRequest, TransportHandle};

    /// Answers every request with its path; fails the first `fail_first`
    /// sends with a 503
    #[derive(Default)]
    struct PathTransport {
        sends: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl Transport for PathTransport {
        async fn connect(&self, endpoint: &Endpoint, _timeout: Duration) -> NetResult<TransportHandle> {
            Ok(TransportHandle::new(endpoint.host_key()))
        }

        async fn send(
            &self,
            _handle: &TransportHandle,
            request: &OutboundRequest,
        ) -> NetResult<Response> {
            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(NetError::transport("unavailable", Some(503)));
            }
            Ok(Response {
                status: 200,
                headers: Default::default(),
                data: json!({ "url": request.url }),
            })
        }

        async fn close(&self, _handle: &TransportHandle) -> NetResult<()> {
            Ok(())
        }
    }

    fn fast_config() -> ClientConfig {
        let mut config = ClientConfig::default();
        config.retry.initial_delay = Duration::from_millis(1);
        config.retry.jitter = 0.0;
        config
    }

    /// Validates a transient failure is retried through the breaker.
    ///
    /// Assertions:
    /// - The second attempt succeeds and the pool keeps one idle connection.
    /// - Retry statistics record one retry.
    #[tokio::test(start_paused = true)]
    async fn test_request_retries_transient_failure() {
        let transport = Arc::new(PathTransport { fail_first: 1, ..Default::default() });
        let client = ResilientClient::builder()
            .config(fast_config())
            .transport(transport.clone())
            .build()
            .unwrap();

        let response =
            client.request("https://api.example.com/items", RequestOptions::get()).await.unwrap();

        assert_eq!(response.data, json!({ "url": "https://api.example.com/items" }));
        assert_eq!(transport.sends.load(Ordering::SeqCst), 2);

        let stats = client.stats();
        assert_eq!(stats.retry.total_retries, 1);
        assert_eq!(stats.pool.idle, 1);
        assert!(stats.batcher.is_none());
    }

    #[tokio::test]
    async fn test_add_request_without_batching_is_config_error() {
        let client = ResilientClient::builder()
            .transport(Arc::new(PathTransport::default()))
            .build()
            .unwrap();

        let result = client.add_request("https://api.example.com/a", RequestOptions::get()).await;

        assert!(matches!(result, Err(NetError::Common(CommonError::Config { .. }))));
        assert_eq!(client.flush().await, 0);
    }

    /// Validates the pool's acquire wait is kept inside the breaker's call
    /// timeout.
    ///
    /// Assertions:
    /// - Without an explicit value the wait is half of `call_timeout`.
    /// - An explicit `acquire_timeout` is kept as configured.
    #[test]
    fn test_acquire_wait_fits_inside_call_timeout() {
        let client = ResilientClient::builder()
            .transport(Arc::new(PathTransport::default()))
            .build()
            .unwrap();
        let call_timeout = client.circuit_breaker().config().call_timeout;
        assert_eq!(client.pool().config().acquire_timeout, Some(call_timeout / 2));
        assert!(client.pool().config().wait_timeout() < call_timeout);

        let mut config = ClientConfig::default();
        config.pool.acquire_timeout = Some(Duration::from_secs(20));
        let client = ResilientClient::builder()
            .config(config)
            .transport(Arc::new(PathTransport::default()))
            .build()
            .unwrap();
        assert_eq!(client.pool().config().acquire_timeout, Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = ClientConfig::default();
        config.circuit_breaker.failure_threshold = 0;

        assert!(ResilientClient::builder().config(config).build().is_err());
    }
}
