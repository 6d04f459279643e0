//! Resilience hot-path benchmarks
//!
//! Circuit breaker admission, backoff computation and batch queueing.
//!
//! Run with: `cargo bench --bench resilience_bench -p synclink-client`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use synclink_client::retry::apply_jitter;
use synclink_client::{
    BatchEnvelope, BatchResponseEnvelope, BatchResponseItem, BatchSender, BatcherConfig,
    CircuitBreaker, CircuitBreakerConfig, Compressor, ExponentialBackoff, NetError, NetResult,
    RequestBatcher, RequestOptions, RetryConfig,
};
use tokio::runtime::Builder as RuntimeBuilder;

fn build_runtime() -> tokio::runtime::Runtime {
    RuntimeBuilder::new_current_thread()
        .enable_all()
        .build()
        .expect("benchmark runtime should build")
}

// ============================================================================
// Circuit Breaker Benchmarks
// ============================================================================

fn bench_circuit_breaker(c: &mut Criterion) {
    let runtime = build_runtime();
    let mut group = c.benchmark_group("circuit_breaker");

    group.bench_function("execute_closed_success", |b| {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default())
            .expect("default breaker config is valid");
        b.to_async(&runtime).iter(|| async {
            let result = breaker.execute(|| async { Ok::<_, NetError>(1_u32) }).await;
            black_box(result)
        });
    });

    group.bench_function("execute_open_rejection", |b| {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default())
            .expect("default breaker config is valid");
        breaker.force_open();
        b.to_async(&runtime).iter(|| async {
            let result = breaker.execute(|| async { Ok::<_, NetError>(()) }).await;
            black_box(result)
        });
    });

    group.bench_function("stats_snapshot", |b| {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default())
            .expect("default breaker config is valid");
        b.iter(|| black_box(breaker.stats()));
    });

    group.finish();
}

// ============================================================================
// Backoff Benchmarks
// ============================================================================

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");
    let policy = ExponentialBackoff::from_config(&RetryConfig::default());

    for attempt in [1_u32, 5, 20] {
        group.bench_with_input(BenchmarkId::new("base_delay", attempt), &attempt, |b, &attempt| {
            b.iter(|| black_box(policy.base_delay(black_box(attempt))));
        });
    }

    group.bench_function("apply_jitter", |b| {
        b.iter(|| black_box(apply_jitter(black_box(Duration::from_millis(400)), 0.1)));
    });

    group.finish();
}

// ============================================================================
// Batcher Benchmarks
// ============================================================================

struct NullSender;

#[async_trait]
impl BatchSender for NullSender {
    async fn send_batch(&self, batch: &BatchEnvelope) -> NetResult<BatchResponseEnvelope> {
        Ok(BatchResponseEnvelope {
            batch_id: batch.batch_id.clone(),
            responses: batch
                .requests
                .iter()
                .map(|r| BatchResponseItem::ok(&r.id, 200, serde_json::Value::Null))
                .collect(),
        })
    }
}

fn bench_batcher(c: &mut Criterion) {
    let runtime = build_runtime();
    let mut group = c.benchmark_group("batcher");

    group.bench_function("full_batch_round_trip", |b| {
        let config = BatcherConfig { max_batch_size: 10, ..BatcherConfig::default() };
        let batcher = RequestBatcher::new(config, Arc::new(NullSender))
            .expect("default batcher config is valid");
        b.to_async(&runtime).iter(|| async {
            let requests = (0..10).map(|i| {
                batcher.add_request(
                    "https://api.example.com/items",
                    RequestOptions::post_json(serde_json::json!({ "n": i })),
                )
            });
            black_box(futures::future::join_all(requests).await)
        });
    });

    group.bench_function("gzip_4kb_body", |b| {
        let compressor = Compressor::new(1024);
        let body = br#"{"id":"r","url":"https://api.example.com/items","method":"GET"}"#.repeat(64);
        b.iter(|| black_box(compressor.compress_if_needed(black_box(&body))));
    });

    group.finish();
}

criterion_group!(benches, bench_circuit_breaker, bench_backoff, bench_batcher);
criterion_main!(benches);
