//! # collector-resilience
//!
//! Failure-and-rate resilience layer shared by external-data collectors.
//!
//! ## Overview
//!
//! Every collector polls an unreliable upstream API (exchanges, social
//! networks, on-chain data providers). This crate keeps each collector alive
//! and well-behaved: it absorbs transient failures, adapts to rate limits and
//! exposes uniform health signals, so collector authors only write the
//! source-specific `collect_once`.
//!
//! ## Key Features
//!
//! - **Circuit breaker**: Closed / Open / HalfOpen per collector, with growing cooldowns
//! - **Adaptive rate limiter**: per-endpoint spacing driven by quota headers, 429s and latency
//! - **Request orchestrator**: [`ResilientClient`] composes both with retry and exponential backoff
//! - **Scheduler**: [`CollectionScheduler`] runs the periodic loop with start/stop/connect/disconnect
//! - **Persistence**: breaker and limiter state survive restarts through the [`store`] adapter
//! - **Health**: structured [`HealthReport`] for dashboards and alerting
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use collector_resilience::{ApiRequest, CollectorConfig, ResilientClient};
//! use collector_resilience::transport::{HttpTransport, Transport};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> collector_resilience::Result<()> {
//!     collector_resilience::telemetry::init_tracing("info");
//!
//!     let config = CollectorConfig::new("coingecko")
//!         .with_base_url("https://api.coingecko.com/api/v3")
//!         .with_env_overrides("COINGECKO")?;
//!     let transport = Arc::new(HttpTransport::from_config(&config)?);
//!     transport.connect().await?;
//!
//!     let client = ResilientClient::from_config(&config, transport)?;
//!     let resp = client
//!         .execute(ApiRequest::get("/simple/price").with_param("ids", "bitcoin"))
//!         .await?;
//!     println!("{}", resp.text());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`resilience`] | Circuit breaker and adaptive rate limiter |
//! | [`client`] | Request orchestrator with retry/backoff |
//! | [`collector`] | Collection scheduler, lifecycle and health |
//! | [`store`] | State store adapter for cross-restart persistence |
//! | [`transport`] | Transport boundary and reqwest-backed HTTP transport |
//! | [`clock`] | Clock/sleep primitive, real and manual |
//! | [`config`] | Typed configuration with YAML and env loading |
//! | [`telemetry`] | Logging bootstrap and collector event sinks |

pub mod client;
pub mod clock;
pub mod collector;
pub mod config;
pub mod events;
pub mod resilience;
pub mod store;
pub mod telemetry;
pub mod transport;

// Re-export main types for convenience
pub use client::{ApiRequest, ApiResponse, RequestStats, ResilientClient, ResilientClientBuilder};
pub use collector::{
    CollectionReport, CollectionScheduler, Collector, CollectorGroup, HealthReport, HealthState,
};
pub use config::{CollectorConfig, RetryConfig};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimiter, RateLimiterConfig,
};
pub use telemetry::{CollectorEvent, EventSink};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
