//! Resilience primitives owned by every collector.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Closed / Open / HalfOpen failure detector with cooldown backoff |
//! | [`rate_limiter`] | Adaptive throttle driven by quota headers, 429s and latency |
//!
//! Both are independent of each other and of the transport. The
//! [`client`](crate::client) orchestrator composes them per request.
//!
//! ```rust
//! use collector_resilience::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let config = CircuitBreakerConfig::new()
//!     .with_failure_threshold(3)
//!     .with_timeout_secs(5.0);
//! let breaker = CircuitBreaker::new("binance", config);
//!
//! if breaker.can_attempt() {
//!     // Make API call...
//!     breaker.record_success();
//! }
//! ```
//!
//! ```rust
//! use collector_resilience::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
//!
//! # async fn demo() {
//! let limiter = RateLimiter::new("binance", RateLimiterConfig::new().with_default_rate(5.0));
//! limiter.wait(Some("/api/v3/ticker")).await;
//! // Issue the request, then feed the outcome back:
//! limiter.adjust_rate(std::time::Duration::from_millis(120), 200).await;
//! # }
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitBreakerStats,
    CircuitBreakerStatus, CircuitState,
};
pub use rate_limiter::{
    parse_retry_after, RateLimiter, RateLimiterConfig, RateLimiterSnapshot, RateLimiterStats,
    RateLimiterStatus,
};
