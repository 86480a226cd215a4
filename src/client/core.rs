use crate::client::policy::RetryPolicy;
use crate::client::types::{ApiRequest, ApiResponse, AtomicRequestStats, RequestStats};
use crate::clock::Clock;
use crate::config::CollectorConfig;
use crate::events::{CollectorEvent, EventSink};
use crate::resilience::{CircuitBreaker, RateLimiter};
use crate::transport::{Headers, Transport};
use crate::Result;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Resilient client for one collector.
///
/// Owns shared handles to the collector's breaker and limiter; every call goes
/// through breaker gate, limiter wait, transport and retry policy.
pub struct ResilientClient {
    pub(crate) name: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) policy: RetryPolicy,
    pub(crate) request_timeout: Duration,
    pub(crate) default_headers: Headers,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) stats: Arc<AtomicRequestStats>,
}

impl ResilientClient {
    pub fn builder(name: impl Into<String>) -> crate::client::ResilientClientBuilder {
        crate::client::ResilientClientBuilder::new(name)
    }

    /// Client with breaker, limiter and retry policy built from `cfg`.
    pub fn from_config(cfg: &CollectorConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        crate::client::ResilientClientBuilder::from_config(cfg)
            .with_transport(transport)
            .build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn stats(&self) -> RequestStats {
        self.stats.to_stats()
    }

    /// GET `endpoint` with the client's default retry settings.
    pub async fn request(&self, endpoint: &str) -> Result<ApiResponse> {
        self.execute(ApiRequest::get(endpoint)).await
    }

    /// GET `endpoint` with query parameters and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<T> {
        let mut req = ApiRequest::get(endpoint);
        for (k, v) in params {
            req = req.with_param(*k, *v);
        }
        self.execute(req).await?.json()
    }

    pub(crate) async fn emit(&self, event: CollectorEvent) {
        if let Err(e) = self.events.report(event).await {
            debug!(collector = self.name.as_str(), error = %e, "event sink rejected event");
        }
    }
}
