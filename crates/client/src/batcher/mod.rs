//! Request batcher: the top-level entry point for logical requests
//!
//! Requests are queued by priority and sent together as one network call
//! per batch. A cycle starts when the batch timer fires, when the queue
//! reaches `max_batch_size`, or on [`RequestBatcher::flush`]. Each cycle
//! takes requests from the highest priority level downward.
//!
//! Identical reads (same method, url and headers) that are still queued are
//! coalesced: the later caller waits on the earlier entry and both receive
//! the same result.
//!
//! When the batch call itself fails with a retryable error, every request is
//! requeued at the head of its level until its own retry limit is reached;
//! after that it fails with the batch error. Levels are served strictly, so
//! a steady stream of high priority requests can starve lower levels.

mod compression;
mod queue;
mod sender;
mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use synclink_common::duration_millis;
use synclink_common::error::{CommonError, CommonResult};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use self::compression::Compressor;
use self::queue::RequestQueue;
pub use self::sender::{BatchSender, PooledBatchSender};
use self::types::{CoalesceKey, QueuedRequest};
pub use self::types::{BatchEnvelope, BatchRequestItem, BatchResponseEnvelope, BatchResponseItem};
use crate::error::{status_is_retryable, ErrorKind, NetError, NetResult};
use crate::events::{EventBus, NetEvent};
use crate::transport::{Endpoint, RequestBody, RequestOptions, Response};

/// Batching, coalescing and per-request retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    pub max_batch_size: usize,
    /// Delay between the first queued request and its batch
    #[serde(with = "duration_millis")]
    pub batch_interval: Duration,
    /// Requeues allowed per request after batch-level failures
    pub max_retries: u32,
    pub enable_compression: bool,
    /// Bodies larger than this many bytes are gzipped when compression is on
    pub compression_threshold: usize,
    pub enable_coalescing: bool,
    pub priority_levels: usize,
    /// Deadline for one batch network call
    #[serde(with = "duration_millis")]
    pub dispatch_timeout: Duration,
    /// Backend endpoint accepting batch envelopes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_url: Option<String>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            batch_interval: Duration::from_millis(50),
            max_retries: 3,
            enable_compression: false,
            compression_threshold: 1024,
            enable_coalescing: true,
            priority_levels: 3,
            dispatch_timeout: Duration::from_secs(30),
            batch_url: None,
        }
    }
}

impl BatcherConfig {
    pub fn validate(&self) -> CommonResult<()> {
        if self.max_batch_size == 0 {
            return Err(CommonError::validation("max_batch_size", "must be at least 1"));
        }
        if self.priority_levels == 0 {
            return Err(CommonError::validation("priority_levels", "must be at least 1"));
        }
        if self.dispatch_timeout.is_zero() {
            return Err(CommonError::validation("dispatch_timeout", "must be non-zero"));
        }
        if let Some(url) = &self.batch_url {
            Endpoint::parse(url)
                .map_err(|e| CommonError::validation("batch_url", e.to_string()))?;
        }
        Ok(())
    }

    /// Compressor matching these settings, if compression is enabled
    pub fn compressor(&self) -> Option<Compressor> {
        self.enable_compression.then(|| Compressor::new(self.compression_threshold))
    }
}

#[derive(Debug, Default)]
struct BatcherMetrics {
    requests_added: AtomicU64,
    requests_coalesced: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    requests_retried: AtomicU64,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    batched_requests: AtomicU64,
    in_flight_batches: AtomicU64,
}

/// Point-in-time batcher statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatcherStats {
    pub queued: usize,
    /// Queue depth per priority level, index = priority
    pub queue_depth: Vec<usize>,
    pub in_flight_batches: u64,
    pub requests_added: u64,
    pub requests_coalesced: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub requests_retried: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub average_batch_size: f64,
}

/// Groups logical requests into batches
///
/// Cloning yields another handle to the same queues.
#[derive(Clone)]
pub struct RequestBatcher {
    config: Arc<BatcherConfig>,
    sender: Arc<dyn BatchSender>,
    queue: Arc<Mutex<RequestQueue>>,
    timer_armed: Arc<AtomicBool>,
    metrics: Arc<BatcherMetrics>,
    shutdown: Arc<AtomicBool>,
    events: EventBus,
}

impl std::fmt::Debug for RequestBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBatcher")
            .field("config", &self.config)
            .field("queued", &self.queue.lock().len())
            .finish()
    }
}

impl RequestBatcher {
    pub fn new(config: BatcherConfig, sender: Arc<dyn BatchSender>) -> CommonResult<Self> {
        config.validate()?;
        let queue = RequestQueue::new(config.priority_levels);
        Ok(Self {
            config: Arc::new(config),
            sender,
            queue: Arc::new(Mutex::new(queue)),
            timer_armed: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(BatcherMetrics::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            events: EventBus::default(),
        })
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    /// Queue a request and wait for its batch to complete
    ///
    /// # Errors
    ///
    /// - `RequestRejected` / `NoResponse` for per-request failures inside a
    ///   successful batch
    /// - `BatchTransport` once the batch call failed and this request has
    ///   no retries left
    /// - `ShuttingDown` after [`shutdown`](Self::shutdown)
    #[instrument(skip(self, options), fields(method = %options.method))]
    pub async fn add_request(&self, url: &str, options: RequestOptions) -> NetResult<Response> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(NetError::ShuttingDown);
        }
        Endpoint::parse(url)?;

        let body = match options.body {
            None => None,
            Some(RequestBody::Json(value)) => Some(value),
            Some(RequestBody::Raw { .. }) => {
                return Err(CommonError::validation(
                    "body",
                    "raw bodies cannot travel inside a JSON batch",
                )
                .into());
            }
        };

        let coalesce_key = (self.config.enable_coalescing
            && options.method.is_idempotent_read()
            && body.is_none())
        .then(|| CoalesceKey::new(options.method, url, &options.headers));

        let (tx, rx) = oneshot::channel();
        let (event, queued) = {
            let mut queue = self.queue.lock();
            let priority = options
                .priority
                .map_or_else(|| queue.default_priority(), |p| queue.clamp(p));

            let attached = match &coalesce_key {
                Some(key) => queue.coalesce(key, tx),
                None => Err(tx),
            };

            let event = match attached {
                Ok((request_id, waiters)) => {
                    self.metrics.requests_coalesced.fetch_add(1, Ordering::Relaxed);
                    NetEvent::RequestCoalesced { request_id, url: url.to_string(), waiters }
                }
                Err(tx) => {
                    let request_id = Uuid::new_v4().to_string();
                    queue.push(QueuedRequest {
                        id: request_id.clone(),
                        url: url.to_string(),
                        method: options.method,
                        headers: options.headers,
                        body,
                        priority,
                        enqueued_at: Instant::now(),
                        retry_count: 0,
                        coalesce_key,
                        waiters: vec![tx],
                    });
                    NetEvent::RequestAdded { request_id, url: url.to_string(), priority }
                }
            };
            (event, queue.len())
        };

        self.metrics.requests_added.fetch_add(1, Ordering::Relaxed);
        debug!(event = event.name(), queued, "request queued");
        self.events.emit(event);

        if queued >= self.config.max_batch_size {
            self.spawn_cycle();
        } else {
            self.schedule();
        }

        rx.await.unwrap_or(Err(NetError::ShuttingDown))
    }

    /// Arm the batch timer unless a cycle is already pending
    fn schedule(&self) {
        if self.timer_armed.swap(true, Ordering::AcqRel) {
            return;
        }
        let batcher = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(batcher.config.batch_interval).await;
            batcher.timer_armed.store(false, Ordering::Release);
            batcher.run_cycle().await;
        });
    }

    fn spawn_cycle(&self) {
        let batcher = self.clone();
        tokio::spawn(async move {
            batcher.run_cycle().await;
        });
    }

    async fn run_cycle(&self) {
        let batch = self.queue.lock().take_batch(self.config.max_batch_size);
        if !batch.is_empty() {
            self.dispatch(batch).await;
        }
        if !self.queue.lock().is_empty() {
            self.schedule();
        }
    }

    /// Send everything queued now, batch after batch
    ///
    /// Returns the number of requests dispatched, requeued attempts
    /// included.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> usize {
        let mut dispatched = 0;
        loop {
            let batch = self.queue.lock().take_batch(self.config.max_batch_size);
            if batch.is_empty() {
                break;
            }
            dispatched += batch.len();
            self.dispatch(batch).await;
        }
        dispatched
    }

    async fn dispatch(&self, batch: Vec<QueuedRequest>) {
        let batch_id = Uuid::new_v4().to_string();
        let size = batch.len();
        let oldest_wait_ms =
            batch.iter().map(|r| r.enqueued_at.elapsed().as_millis()).max().unwrap_or(0);
        debug!(batch_id = %batch_id, size, oldest_wait_ms, "dispatching batch");
        let envelope = BatchEnvelope {
            batch_id: batch_id.clone(),
            requests: batch.iter().map(QueuedRequest::to_wire).collect(),
        };

        self.metrics.in_flight_batches.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let limit = self.config.dispatch_timeout;
        let outcome = tokio::time::timeout(limit, self.sender.send_batch(&envelope))
            .await
            .unwrap_or(Err(NetError::OperationTimeout { timeout: limit }));
        self.metrics.in_flight_batches.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            Ok(response) => self.complete_batch(&batch_id, batch, response, started),
            Err(err) => self.fail_batch(&batch_id, batch, &err),
        }
        debug!(batch_id = %batch_id, size, "batch cycle finished");
    }

    fn complete_batch(
        &self,
        batch_id: &str,
        batch: Vec<QueuedRequest>,
        response: BatchResponseEnvelope,
        started: Instant,
    ) {
        if response.batch_id != batch_id {
            warn!(batch_id, received = %response.batch_id, "batch response id mismatch");
        }
        let size = batch.len();
        let mut results: HashMap<String, BatchResponseItem> =
            response.responses.into_iter().map(|item| (item.request_id.clone(), item)).collect();

        for request in batch {
            let result = match results.remove(&request.id) {
                Some(item) => item.into_result(),
                None => Err(NetError::NoResponse { request_id: request.id.clone() }),
            };
            match &result {
                Ok(_) => {
                    self.metrics.requests_completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    self.metrics.requests_failed.fetch_add(1, Ordering::Relaxed);
                    self.events.emit(NetEvent::RequestFailure {
                        request_id: request.id.clone(),
                        error: err.to_string(),
                    });
                }
            }
            request.complete(result);
        }
        if !results.is_empty() {
            debug!(batch_id, unmatched = results.len(), "ignoring responses for unknown requests");
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.metrics.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.metrics.batched_requests.fetch_add(size as u64, Ordering::Relaxed);
        info!(batch_id, size, duration_ms, "batch completed");
        self.events.emit(NetEvent::BatchCompleted {
            batch_id: batch_id.to_string(),
            size,
            duration_ms,
        });
    }

    fn fail_batch(&self, batch_id: &str, batch: Vec<QueuedRequest>, err: &NetError) {
        let size = batch.len();
        self.metrics.batches_failed.fetch_add(1, Ordering::Relaxed);
        warn!(batch_id, size, error = %err, "batch dispatch failed");
        self.events.emit(NetEvent::BatchError {
            batch_id: batch_id.to_string(),
            size,
            error: err.to_string(),
        });

        let retryable = batch_failure_is_retryable(err);
        let shutting_down = self.shutdown.load(Ordering::Acquire);
        let final_error = NetError::BatchTransport { message: err.to_string(), status: err.status() };
        let mut requeue = Vec::new();

        for mut request in batch {
            if retryable && !shutting_down && request.retry_count < self.config.max_retries {
                request.retry_count += 1;
                self.metrics.requests_retried.fetch_add(1, Ordering::Relaxed);
                self.events.emit(NetEvent::RequestRetry {
                    request_id: request.id.clone(),
                    retry_count: request.retry_count,
                    error: err.to_string(),
                });
                requeue.push(request);
            } else {
                self.metrics.requests_failed.fetch_add(1, Ordering::Relaxed);
                self.events.emit(NetEvent::RequestFailure {
                    request_id: request.id.clone(),
                    error: final_error.to_string(),
                });
                request.complete(Err(final_error.clone()));
            }
        }

        if !requeue.is_empty() {
            debug!(batch_id, requeued = requeue.len(), "requeueing requests after batch failure");
            self.queue.lock().requeue_front(requeue);
        }
    }

    /// Queued requests per priority level
    pub fn queue_depth(&self) -> Vec<usize> {
        self.queue.lock().depths()
    }

    pub fn stats(&self) -> BatcherStats {
        let (queued, queue_depth) = {
            let queue = self.queue.lock();
            (queue.len(), queue.depths())
        };
        let m = &self.metrics;
        let batches_sent = m.batches_sent.load(Ordering::Relaxed);
        let batched = m.batched_requests.load(Ordering::Relaxed);

        BatcherStats {
            queued,
            queue_depth,
            in_flight_batches: m.in_flight_batches.load(Ordering::Relaxed),
            requests_added: m.requests_added.load(Ordering::Relaxed),
            requests_coalesced: m.requests_coalesced.load(Ordering::Relaxed),
            requests_completed: m.requests_completed.load(Ordering::Relaxed),
            requests_failed: m.requests_failed.load(Ordering::Relaxed),
            requests_retried: m.requests_retried.load(Ordering::Relaxed),
            batches_sent,
            batches_failed: m.batches_failed.load(Ordering::Relaxed),
            average_batch_size: if batches_sent == 0 {
                0.0
            } else {
                batched as f64 / batches_sent as f64
            },
        }
    }

    /// Reject new requests, then send what is queued
    ///
    /// Requests whose batch fails during shutdown are not requeued.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let dispatched = self.flush().await;

        let leftover = self.queue.lock().drain();
        for request in leftover {
            request.complete(Err(NetError::ShuttingDown));
        }
        info!(dispatched, "request batcher shut down");
    }
}

/// Batch failures are retried by HTTP status; local failures are not
fn batch_failure_is_retryable(err: &NetError) -> bool {
    match err.root_cause().kind() {
        ErrorKind::Common | ErrorKind::ShuttingDown | ErrorKind::RetryBudgetExceeded => false,
        _ => status_is_retryable(err.status()),
    }
}
