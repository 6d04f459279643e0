use async_trait::async_trait;
use synclink_common::error::CommonError;
use synclink_common::time::{Clock, SystemClock};
use tracing::debug;

use super::compression::Compressor;
use super::types::{BatchEnvelope, BatchResponseEnvelope};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::NetResult;
use crate::pool::ConnectionPool;
use crate::retry::RetryManager;
use crate::transport::{Method, RequestBody, RequestOptions};

/// Delivers one batch and returns the backend's batch response
#[async_trait]
pub trait BatchSender: Send + Sync + 'static {
    async fn send_batch(&self, batch: &BatchEnvelope) -> NetResult<BatchResponseEnvelope>;
}

/// POSTs batches to `batch_url` through retry, breaker and pool
pub struct PooledBatchSender<C: Clock = SystemClock> {
    batch_url: String,
    pool: ConnectionPool<C>,
    breaker: CircuitBreaker<C>,
    retry: RetryManager<C>,
    compressor: Option<Compressor>,
}

impl<C: Clock> std::fmt::Debug for PooledBatchSender<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBatchSender")
            .field("batch_url", &self.batch_url)
            .field("compressor", &self.compressor)
            .finish()
    }
}

impl<C: Clock> PooledBatchSender<C> {
    pub fn new(
        batch_url: impl Into<String>,
        pool: ConnectionPool<C>,
        breaker: CircuitBreaker<C>,
        retry: RetryManager<C>,
    ) -> Self {
        Self { batch_url: batch_url.into(), pool, breaker, retry, compressor: None }
    }

    /// Gzip bodies larger than the compressor's threshold
    pub fn with_compression(mut self, compressor: Compressor) -> Self {
        self.compressor = Some(compressor);
        self
    }

    fn encode(&self, batch: &BatchEnvelope) -> NetResult<RequestOptions> {
        let json = serde_json::to_vec(batch).map_err(CommonError::from)?;
        let original = json.len();

        let (bytes, content_encoding) =
            match self.compressor.map(|c| c.compress_if_needed(&json)).transpose()?.flatten() {
                Some(compressed) => {
                    debug!(original, compressed = compressed.len(), "compressed batch body");
                    (compressed, Some("gzip".to_string()))
                }
                None => (json, None),
            };

        let mut options = RequestOptions::new(Method::Post);
        options.body = Some(RequestBody::Raw {
            bytes,
            content_type: "application/json".to_string(),
            content_encoding,
        });
        Ok(options)
    }
}

#[async_trait]
impl<C: Clock> BatchSender for PooledBatchSender<C> {
    async fn send_batch(&self, batch: &BatchEnvelope) -> NetResult<BatchResponseEnvelope> {
        let options = self.encode(batch)?;

        let response = self
            .retry
            .execute(|| {
                let options = options.clone();
                async move {
                    self.breaker.execute(|| self.pool.request(&self.batch_url, options)).await
                }
            })
            .await?;

        serde_json::from_value(response.data).map_err(|e| {
            CommonError::serialization_format("json", format!("invalid batch response: {e}"))
                .into()
        })
    }
}
