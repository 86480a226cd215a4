//! Request orchestrator: one resilient upstream call at a time.
//!
//! Composes the collector's circuit breaker and rate limiter with a transport
//! and a retry policy. Implementation details are split into submodules under
//! `src/client/`.

pub mod builder;
pub mod core;
mod execution;
mod policy;
pub mod types;

pub use builder::ResilientClientBuilder;
pub use core::ResilientClient;
pub use policy::RetryPolicy;
pub use types::{ApiRequest, ApiResponse, RequestStats};

/// Header carrying the per-attempt correlation id.
pub const REQUEST_ID_HEADER: &str = "x-collector-request-id";
