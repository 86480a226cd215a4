use crate::client::core::ResilientClient;
use crate::client::policy::RetryPolicy;
use crate::client::types::AtomicRequestStats;
use crate::clock::{system_clock, Clock};
use crate::config::{CollectorConfig, RetryConfig};
use crate::events::{noop_sink, EventSink};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig};
use crate::transport::{Headers, Transport};
use crate::{Error, ErrorContext, Result};
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`ResilientClient`].
///
/// A transport is mandatory. Breaker and limiter are created from their configs
/// (sharing the builder's clock) unless existing instances are injected.
pub struct ResilientClientBuilder {
    name: String,
    transport: Option<Arc<dyn Transport>>,
    breaker: Option<Arc<CircuitBreaker>>,
    limiter: Option<Arc<RateLimiter>>,
    breaker_config: CircuitBreakerConfig,
    limiter_config: RateLimiterConfig,
    retry: RetryConfig,
    clock: Arc<dyn Clock>,
    request_timeout: Duration,
    default_headers: Headers,
    events: Arc<dyn EventSink>,
}

impl ResilientClientBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: None,
            breaker: None,
            limiter: None,
            breaker_config: CircuitBreakerConfig::default(),
            limiter_config: RateLimiterConfig::default(),
            retry: RetryConfig::default(),
            clock: system_clock(),
            request_timeout: Duration::from_secs(30),
            default_headers: Headers::new(),
            events: noop_sink(),
        }
    }

    pub fn from_config(cfg: &CollectorConfig) -> Self {
        let mut builder = Self::new(cfg.name.clone())
            .with_breaker_config(cfg.circuit_breaker.clone())
            .with_limiter_config(cfg.rate_limiter.clone())
            .with_retry(cfg.retry.clone())
            .with_request_timeout(cfg.request_timeout());
        for (k, v) in &cfg.default_headers {
            builder
                .default_headers
                .insert(k.to_ascii_lowercase(), v.clone());
        }
        builder
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share an existing breaker instead of building one.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_breaker_config(mut self, cfg: CircuitBreakerConfig) -> Self {
        self.breaker_config = cfg;
        self
    }

    pub fn with_limiter_config(mut self, cfg: RateLimiterConfig) -> Self {
        self.limiter_config = cfg;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_default_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.default_headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Inject an event sink. Default is a no-op sink.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn build(self) -> Result<ResilientClient> {
        let transport = self.transport.ok_or_else(|| {
            Error::configuration_with_context(
                "a transport is required",
                ErrorContext::new()
                    .with_field_path("transport")
                    .with_details(format!("collector '{}'", self.name))
                    .with_source("client_builder"),
            )
        })?;
        if self.request_timeout.is_zero() {
            return Err(Error::configuration_with_context(
                "request timeout must be positive",
                ErrorContext::new()
                    .with_field_path("request_timeout_secs")
                    .with_source("client_builder"),
            ));
        }

        let breaker = match self.breaker {
            Some(b) => b,
            None => Arc::new(CircuitBreaker::with_clock(
                self.name.clone(),
                self.breaker_config,
                self.clock.clone(),
            )),
        };
        let limiter = match self.limiter {
            Some(l) => l,
            None => Arc::new(RateLimiter::with_clock(
                self.name.clone(),
                self.limiter_config,
                self.clock.clone(),
            )),
        };

        Ok(ResilientClient {
            name: self.name,
            transport,
            breaker,
            limiter,
            clock: self.clock,
            policy: RetryPolicy::from_config(&self.retry),
            request_timeout: self.request_timeout,
            default_headers: self.default_headers,
            events: self.events,
            stats: Arc::new(AtomicRequestStats::new()),
        })
    }
}
