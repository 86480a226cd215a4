//! Transport boundary between the resilience core and the upstream API.
//!
//! The core only needs to issue one request and get back a status, headers
//! and a body, or a [`TransportError`]. [`HttpTransport`] is the reqwest-backed
//! implementation used by collector processes; tests substitute scripted ones.

mod http;

pub use http::HttpTransport;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Response/request headers with lowercased names.
pub type Headers = BTreeMap<String, String>;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Extract the first non-empty header value from a list of candidate names.
pub fn header_first<S: AsRef<str>>(headers: &Headers, names: &[S]) -> Option<String> {
    for name in names {
        let key = name.as_ref().to_ascii_lowercase();
        if let Some(v) = headers.get(&key) {
            let v = v.trim();
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }
    None
}

/// Build a [`Headers`] map, lowercasing names. Later duplicates are ignored.
pub fn normalize_headers<I, K, V>(pairs: I) -> Headers
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let mut out = Headers::new();
    for (k, v) in pairs {
        out.entry(k.as_ref().to_ascii_lowercase()).or_insert_with(|| v.into());
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    /// Lenient parse; unknown verbs fall back to GET.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "PATCH" => Method::Patch,
            "DELETE" => Method::Delete,
            _ => Method::Get,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound call. `target` is either an absolute URL or a path resolved
/// against the transport's base URL.
#[derive(Debug, Clone, Default)]
pub struct TransportRequest {
    pub method: Method,
    pub target: String,
    pub headers: Headers,
    pub params: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl TransportRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<String> {
        header_first(&self.headers, &[name])
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Network-level failures are worth another attempt; a disconnected
    /// transport or a malformed request is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout(_) | TransportError::Connect(_) => true,
            TransportError::Http(e) => !e.is_builder() && !e.is_redirect(),
            TransportError::NotConnected | TransportError::Other(_) => false,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn do_request(&self, request: TransportRequest) -> TransportResult<TransportResponse>;

    /// Acquire connections or sessions. Called by the scheduler's `connect`.
    async fn connect(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn disconnect(&self) {}

    fn name(&self) -> &str {
        "transport"
    }
}
