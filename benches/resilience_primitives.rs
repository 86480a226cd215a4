//! Benchmarks for the per-request resilience bookkeeping
//!
//! This benchmark measures:
//! - Circuit breaker admission and outcome recording
//! - Rate limiter feedback (quota headers, latency adaptation)
//! - State snapshot serialization

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

use collector_resilience::clock::ManualClock;
use collector_resilience::transport::normalize_headers;
use collector_resilience::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig};

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");
    let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default());

    group.bench_function("can_attempt_closed", |b| b.iter(|| black_box(breaker.can_attempt())));

    group.bench_function("record_success", |b| b.iter(|| breaker.record_success()));

    group.bench_function("failure_then_success", |b| {
        b.iter(|| {
            breaker.record_failure();
            breaker.record_success();
        })
    });

    group.bench_function("status", |b| b.iter(|| black_box(breaker.status())));
    group.finish();
}

fn bench_rate_limiter(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let clock = ManualClock::new();
    let limiter = RateLimiter::with_clock("bench", RateLimiterConfig::default(), Arc::new(clock));
    let headers = normalize_headers([
        ("X-RateLimit-Remaining", "950"),
        ("X-RateLimit-Limit", "1000"),
        ("X-RateLimit-Reset", "60"),
    ]);

    let mut group = c.benchmark_group("rate_limiter");
    group.throughput(Throughput::Elements(1));

    group.bench_function("parse_rate_limit_headers", |b| {
        b.to_async(&rt)
            .iter(|| async { limiter.parse_rate_limit_headers(black_box(&headers), Some("/ticker")).await })
    });

    group.bench_function("adjust_rate", |b| {
        b.to_async(&rt)
            .iter(|| async { limiter.adjust_rate(black_box(Duration::from_millis(120)), 200).await })
    });

    group.bench_function("estimated_wait", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(limiter.estimated_wait(Some("/ticker")).await) })
    });
    group.finish();
}

fn bench_snapshots(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default());
    let limiter = RateLimiter::new("bench", RateLimiterConfig::default());
    rt.block_on(async {
        for i in 0..32 {
            limiter.record_429(Some(&format!("/endpoint/{}", i)), None).await;
        }
    });

    let mut group = c.benchmark_group("snapshots");
    group.bench_function("breaker_snapshot_json", |b| {
        b.iter(|| serde_json::to_vec(&breaker.snapshot()).unwrap())
    });
    group.bench_function("limiter_snapshot_json", |b| {
        b.to_async(&rt)
            .iter(|| async { serde_json::to_vec(&limiter.snapshot().await).unwrap() })
    });
    group.finish();
}

criterion_group!(benches, bench_circuit_breaker, bench_rate_limiter, bench_snapshots);
criterion_main!(benches);
