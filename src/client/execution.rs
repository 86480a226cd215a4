//! Retry loop of the orchestrator.
//!
//! Side effects per attempt are strictly ordered: limiter wait, transport
//! call, then limiter/breaker bookkeeping for the outcome, then backoff.

use crate::client::core::ResilientClient;
use crate::client::policy::Decision;
use crate::client::types::{ApiRequest, ApiResponse, AtomicRequestStats};
use crate::client::REQUEST_ID_HEADER;
use crate::events::CollectorEvent;
use crate::resilience::{parse_retry_after, CircuitState};
use crate::transport::{TransportError, TransportRequest, TransportResponse};
use crate::{Error, Result};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

enum Failure {
    RateLimited { retry_after: Option<Duration> },
    Failed { status: Option<u16>, message: String },
}

impl ResilientClient {
    /// Execute one logical call with breaker gating, rate limiting and retries.
    ///
    /// Returns `CircuitOpen` without touching the limiter when the breaker
    /// rejects the call, `RateLimited` when the last attempt got a 429 and
    /// `RequestFailed` when the last attempt failed otherwise.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
        AtomicRequestStats::incr(&self.stats.total_requests);
        let endpoint = request.endpoint.clone();

        if !self.breaker.can_attempt() {
            AtomicRequestStats::incr(&self.stats.circuit_rejections);
            let retry_in_secs = self.breaker.status().time_until_retry_secs;
            info!(
                collector = self.name.as_str(),
                endpoint = endpoint.as_str(),
                retry_in_secs = retry_in_secs.unwrap_or(0.0),
                "request rejected, circuit open"
            );
            self.emit(CollectorEvent::RequestRejected {
                collector: self.name.clone(),
                endpoint: endpoint.clone(),
                retry_in_secs,
                timestamp: self.clock.unix_now(),
            })
            .await;
            return Err(Error::CircuitOpen {
                collector: self.name.clone(),
                retry_in_secs,
            });
        }

        let max_attempts = request.max_retries.unwrap_or(self.policy.max_attempts).max(1);
        let base_delay = request.retry_delay.unwrap_or(self.policy.base_delay);

        for attempt in 0..max_attempts {
            let waited = self.limiter.wait(Some(&endpoint)).await;
            if !waited.is_zero() {
                debug!(
                    collector = self.name.as_str(),
                    endpoint = endpoint.as_str(),
                    waited_ms = waited.as_millis() as u64,
                    "rate limiter wait"
                );
            }

            let request_id = Uuid::new_v4().to_string();
            AtomicRequestStats::incr(&self.stats.total_attempts);
            if attempt > 0 {
                AtomicRequestStats::incr(&self.stats.retries);
            }

            let started = self.clock.now();
            let outcome = self.send_once(&request, &request_id).await;
            let latency = self.clock.now().duration_since(started).unwrap_or_default();

            let failure = match outcome {
                Ok(resp) if resp.is_success() => {
                    return Ok(self
                        .on_success(resp, &endpoint, request_id, attempt + 1, latency)
                        .await);
                }
                Ok(resp) if resp.status == 429 => {
                    let retry_after = parse_retry_after(&resp.headers, self.clock.now());
                    self.limiter.record_429(Some(&endpoint), retry_after).await;
                    self.record_breaker_failure().await;
                    AtomicRequestStats::incr(&self.stats.rate_limited_responses);
                    warn!(
                        collector = self.name.as_str(),
                        endpoint = endpoint.as_str(),
                        request_id = request_id.as_str(),
                        attempt,
                        retry_after_secs = retry_after.map(|d| d.as_secs_f64()).unwrap_or(0.0),
                        "upstream rate limit hit"
                    );
                    self.emit(CollectorEvent::RateLimited {
                        collector: self.name.clone(),
                        endpoint: endpoint.clone(),
                        retry_after_secs: retry_after.map(|d| d.as_secs_f64()),
                        timestamp: self.clock.unix_now(),
                    })
                    .await;
                    Failure::RateLimited { retry_after }
                }
                Ok(resp) => {
                    self.record_breaker_failure().await;
                    self.limiter.adjust_rate(latency, resp.status).await;
                    let message = truncate(&resp.text(), 512);
                    warn!(
                        collector = self.name.as_str(),
                        endpoint = endpoint.as_str(),
                        request_id = request_id.as_str(),
                        attempt,
                        http_status = resp.status,
                        latency_ms = latency.as_millis() as u64,
                        "request failed"
                    );
                    Failure::Failed {
                        status: Some(resp.status),
                        message: format!("HTTP {}: {}", resp.status, message),
                    }
                }
                Err(e) => {
                    self.record_breaker_failure().await;
                    warn!(
                        collector = self.name.as_str(),
                        endpoint = endpoint.as_str(),
                        request_id = request_id.as_str(),
                        attempt,
                        error = %e,
                        "transport error"
                    );
                    Failure::Failed {
                        status: None,
                        message: e.to_string(),
                    }
                }
            };
            self.stats.mark_error(self.clock.unix_now());

            match self.policy.decide(attempt, max_attempts, base_delay) {
                Decision::Retry { delay } => {
                    debug!(
                        collector = self.name.as_str(),
                        endpoint = endpoint.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after backoff"
                    );
                    self.clock.sleep(delay).await;
                }
                Decision::Fail => {
                    AtomicRequestStats::incr(&self.stats.failed_requests);
                    return Err(match failure {
                        Failure::RateLimited { retry_after } => Error::RateLimited {
                            collector: self.name.clone(),
                            endpoint,
                            attempts: max_attempts,
                            retry_after_secs: retry_after.map(|d| d.as_secs_f64()),
                        },
                        Failure::Failed { status, message } => Error::RequestFailed {
                            collector: self.name.clone(),
                            endpoint,
                            attempts: max_attempts,
                            status,
                            message,
                        },
                    });
                }
            }
        }

        // The loop always returns on its last attempt.
        Err(Error::RequestFailed {
            collector: self.name.clone(),
            endpoint,
            attempts: max_attempts,
            status: None,
            message: "retry budget exhausted".to_string(),
        })
    }

    async fn send_once(&self, request: &ApiRequest, request_id: &str) -> std::result::Result<TransportResponse, TransportError> {
        let mut treq = TransportRequest::new(request.method, request.endpoint.clone());
        treq.headers = self.default_headers.clone();
        treq.headers
            .extend(request.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        treq.headers
            .insert(REQUEST_ID_HEADER.to_string(), request_id.to_string());
        treq.params = request.params.clone();
        treq.body = request.body.clone();

        match tokio::time::timeout(self.request_timeout, self.transport.do_request(treq)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.request_timeout)),
        }
    }

    async fn on_success(
        &self,
        resp: TransportResponse,
        endpoint: &str,
        request_id: String,
        attempts: u32,
        latency: Duration,
    ) -> ApiResponse {
        self.limiter
            .parse_rate_limit_headers(&resp.headers, Some(endpoint))
            .await;
        self.limiter.adjust_rate(latency, resp.status).await;

        let before = self.breaker.state();
        self.breaker.record_success();
        if before != CircuitState::Closed && self.breaker.state() == CircuitState::Closed {
            self.emit(CollectorEvent::CircuitClosed {
                collector: self.name.clone(),
                timestamp: self.clock.unix_now(),
            })
            .await;
        }
        self.stats.mark_success(self.clock.unix_now());

        debug!(
            collector = self.name.as_str(),
            endpoint,
            request_id = request_id.as_str(),
            http_status = resp.status,
            attempts,
            latency_ms = latency.as_millis() as u64,
            "request succeeded"
        );

        ApiResponse {
            status: resp.status,
            headers: resp.headers,
            body: resp.body,
            request_id,
            attempts,
            latency,
        }
    }

    async fn record_breaker_failure(&self) {
        let before = self.breaker.status();
        self.breaker.record_failure();
        if before.state != CircuitState::Open && self.breaker.state() == CircuitState::Open {
            // Counters reset on the transition; report the run that tripped it.
            let status = self.breaker.status();
            self.emit(CollectorEvent::CircuitOpened {
                collector: self.name.clone(),
                failure_count: before.failure_count.saturating_add(1),
                timeout_secs: status.timeout_secs,
                timestamp: self.clock.unix_now(),
            })
            .await;
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RetryConfig;
    use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig};
    use crate::telemetry::InMemoryEventSink;
    use crate::transport::{Transport, TransportResult};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    type Scripted = TransportResult<TransportResponse>;

    struct ScriptTransport {
        script: Mutex<VecDeque<Scripted>>,
        seen: Mutex<Vec<TransportRequest>>,
    }

    impl ScriptTransport {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptTransport {
        async fn do_request(&self, request: TransportRequest) -> Scripted {
            self.seen.lock().unwrap().push(request);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(TransportResponse::new(200)))
        }
    }

    fn client(transport: Arc<ScriptTransport>, clock: &ManualClock, sink: Arc<InMemoryEventSink>) -> ResilientClient {
        ResilientClient::builder("test")
            .with_transport(transport)
            .with_clock(Arc::new(clock.clone()))
            .with_breaker_config(CircuitBreakerConfig::new().with_failure_threshold(3).with_timeout_secs(5.0))
            .with_limiter_config(RateLimiterConfig::new().with_default_rate(10.0))
            .with_retry(RetryConfig::new().with_max_retries(3).with_retry_delay_secs(1.0))
            .with_event_sink(sink)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures_with_exponential_backoff() {
        let clock = ManualClock::new();
        let transport = ScriptTransport::new(vec![
            Ok(TransportResponse::new(503)),
            Err(TransportError::Connect("refused".into())),
            Ok(TransportResponse::new(200).with_body("ok")),
        ]);
        let c = client(transport.clone(), &clock, Arc::new(InMemoryEventSink::default()));

        let resp = c.request("/ticker").await.unwrap();
        assert_eq!(resp.text(), "ok");
        assert_eq!(resp.attempts, 3);
        assert_eq!(transport.calls(), 3);

        let sleeps = clock.sleeps();
        assert!(sleeps.contains(&Duration::from_secs(1)));
        assert!(sleeps.contains(&Duration::from_secs(2)));

        let stats = c.stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.failed_requests, 0);
        assert_eq!(c.breaker().stats().total_failures, 2);
        assert_eq!(c.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn exhausted_429s_return_rate_limited() {
        let clock = ManualClock::new();
        let limited = || Ok(TransportResponse::new(429).with_header("Retry-After", "2"));
        let transport = ScriptTransport::new(vec![limited(), limited()]);
        let sink = Arc::new(InMemoryEventSink::default());
        let c = client(transport, &clock, sink.clone());

        let err = c
            .execute(ApiRequest::get("/depth").with_max_retries(2))
            .await
            .unwrap_err();
        match err {
            Error::RateLimited {
                attempts,
                retry_after_secs,
                ref endpoint,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(retry_after_secs, Some(2.0));
                assert_eq!(endpoint, "/depth");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(c.stats().rate_limited_responses, 2);
        assert_eq!(sink.events_of_kind("rate_limited").len(), 2);
        assert!(c.limiter().stats().await.rate_limit_hits >= 2);
    }

    #[tokio::test]
    async fn non_retryable_budget_returns_request_failed_with_status() {
        let clock = ManualClock::new();
        let transport = ScriptTransport::new(vec![Ok(TransportResponse::new(404).with_body("missing"))]);
        let c = client(transport, &clock, Arc::new(InMemoryEventSink::default()));
        let err = c
            .execute(ApiRequest::get("/nope").with_max_retries(1))
            .await
            .unwrap_err();
        match err {
            Error::RequestFailed { status, ref message, attempts, .. } => {
                assert_eq!(status, Some(404));
                assert_eq!(attempts, 1);
                assert!(message.contains("missing"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_transport_or_limiter() {
        let clock = ManualClock::new();
        let transport = ScriptTransport::new(vec![
            Ok(TransportResponse::new(500)),
            Ok(TransportResponse::new(500)),
            Ok(TransportResponse::new(500)),
        ]);
        let sink = Arc::new(InMemoryEventSink::default());
        let c = client(transport.clone(), &clock, sink.clone());

        assert!(c.request("/x").await.is_err());
        assert_eq!(c.breaker().state(), CircuitState::Open);
        assert_eq!(sink.events_of_kind("circuit_opened").len(), 1);

        let limiter_requests = c.limiter().stats().await.total_requests;
        let err = c.request("/x").await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(transport.calls(), 3);
        assert_eq!(c.limiter().stats().await.total_requests, limiter_requests);
        assert_eq!(c.stats().circuit_rejections, 1);
        assert_eq!(sink.events_of_kind("request_rejected").len(), 1);
    }

    #[tokio::test]
    async fn recovery_emits_circuit_closed() {
        let clock = ManualClock::new();
        let transport = ScriptTransport::new(vec![]);
        let sink = Arc::new(InMemoryEventSink::default());
        let c = client(transport, &clock, sink.clone());
        c.breaker().force_open();
        clock.advance_secs(5.1);

        // Open -> HalfOpen transition call, then a second trial call to reach the threshold.
        c.request("/x").await.unwrap();
        assert_eq!(c.breaker().state(), CircuitState::HalfOpen);
        c.request("/x").await.unwrap();
        assert_eq!(c.breaker().state(), CircuitState::Closed);
        assert_eq!(sink.events_of_kind("circuit_closed").len(), 1);
    }

    #[tokio::test]
    async fn request_id_header_is_attached_per_attempt() {
        let clock = ManualClock::new();
        let transport = ScriptTransport::new(vec![Ok(TransportResponse::new(500))]);
        let c = client(transport.clone(), &clock, Arc::new(InMemoryEventSink::default()));
        let resp = c
            .execute(ApiRequest::get("/x").with_header("X-Trace", "t1"))
            .await
            .unwrap();
        let seen = transport.seen.lock().unwrap();
        let ids: Vec<_> = seen
            .iter()
            .map(|r| r.headers.get(REQUEST_ID_HEADER).cloned().unwrap())
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert_eq!(ids[1], resp.request_id);
        assert_eq!(seen[0].headers.get("x-trace").map(String::as_str), Some("t1"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("héllo", 2), "h...");
    }
}
