use crate::transport::{header_first, Headers, Method};
use crate::Result;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A logical call. Retries reuse it unchanged.
#[derive(Debug, Clone, Default)]
pub struct ApiRequest {
    pub endpoint: String,
    pub method: Method,
    pub params: Vec<(String, String)>,
    pub headers: Headers,
    pub body: Option<Bytes>,
    /// Overrides the client's attempt budget for this call.
    pub max_retries: Option<u32>,
    /// Overrides the client's base backoff delay for this call.
    pub retry_delay: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            ..Default::default()
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Get, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Post, endpoint)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// JSON-encode `value` as the body and set the content type.
    pub fn with_json<T: Serialize>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .with_header("content-type", "application/json")
            .with_body(body))
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
    /// Id of the attempt that succeeded.
    pub request_id: String,
    /// Attempts spent, including the successful one.
    pub attempts: u32,
    pub latency: Duration,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        header_first(&self.headers, &[name])
    }
}

/// Point-in-time copy of the orchestrator counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestStats {
    /// Logical calls, one per `execute`.
    pub total_requests: u64,
    /// Transport attempts, including retries.
    pub total_attempts: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limited_responses: u64,
    pub retries: u64,
    pub circuit_rejections: u64,
    pub last_success_time: Option<f64>,
    pub last_error_time: Option<f64>,
}

impl RequestStats {
    pub fn success_rate(&self) -> f64 {
        let total = self.successful_requests + self.failed_requests;
        if total == 0 {
            1.0
        } else {
            self.successful_requests as f64 / total as f64
        }
    }
}

// Timestamps are stored as f64 bits; 0 means "never".
pub(crate) struct AtomicRequestStats {
    pub total_requests: AtomicU64,
    pub total_attempts: AtomicU64,
    pub successful_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub rate_limited_responses: AtomicU64,
    pub retries: AtomicU64,
    pub circuit_rejections: AtomicU64,
    last_success_bits: AtomicU64,
    last_error_bits: AtomicU64,
}

impl AtomicRequestStats {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            total_attempts: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            rate_limited_responses: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            circuit_rejections: AtomicU64::new(0),
            last_success_bits: AtomicU64::new(0),
            last_error_bits: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_success(&self, at: f64) {
        Self::incr(&self.successful_requests);
        self.last_success_bits.store(at.to_bits(), Ordering::Relaxed);
    }

    pub fn mark_error(&self, at: f64) {
        self.last_error_bits.store(at.to_bits(), Ordering::Relaxed);
    }

    pub fn to_stats(&self) -> RequestStats {
        let ts = |bits: &AtomicU64| {
            let v = f64::from_bits(bits.load(Ordering::Relaxed));
            (v > 0.0).then_some(v)
        };
        RequestStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            rate_limited_responses: self.rate_limited_responses.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            last_success_time: ts(&self.last_success_bits),
            last_error_time: ts(&self.last_error_bits),
        }
    }
}
