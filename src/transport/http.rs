use super::{Headers, Method, Transport, TransportError, TransportRequest, TransportResponse, TransportResult};
use crate::config::CollectorConfig;
use crate::{Error, ErrorContext, Result};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use reqwest::Proxy;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// reqwest-backed transport. The underlying client only exists between
/// `connect` and `disconnect`.
#[derive(Debug)]
pub struct HttpTransport {
    name: String,
    base_url: Option<Url>,
    timeout: Duration,
    default_headers: Headers,
    api_key: Option<String>,
    client: ArcSwapOption<reqwest::Client>,
}

impl HttpTransport {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let api_key = Self::get_api_key(&name);
        Self {
            name,
            base_url: None,
            timeout: Duration::from_secs(30),
            default_headers: Headers::new(),
            api_key,
            client: ArcSwapOption::empty(),
        }
    }

    pub fn from_config(cfg: &CollectorConfig) -> Result<Self> {
        cfg.validate()?;
        let mut transport = Self::new(cfg.name.clone()).with_timeout(cfg.request_timeout());
        if let Some(ref base) = cfg.base_url {
            transport = transport.with_base_url(base)?;
        }
        for (k, v) in &cfg.default_headers {
            transport = transport.with_default_header(k, v.clone());
        }
        Ok(transport)
    }

    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        let url = Url::parse(base_url).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid base URL: {}", e),
                ErrorContext::new()
                    .with_field_path("base_url")
                    .with_details(base_url.to_string())
                    .with_source("http_transport"),
            )
        })?;
        self.base_url = Some(url);
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_default_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.default_headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn is_connected(&self) -> bool {
        self.client.load().is_some()
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    // {NAME}_API_KEY, with non-alphanumerics folded to '_'.
    fn get_api_key(name: &str) -> Option<String> {
        let var: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        env::var(format!("{}_API_KEY", var)).ok().filter(|k| !k.is_empty())
    }

    fn build_client(&self) -> TransportResult<reqwest::Client> {
        // Production-friendly defaults, env-overridable.
        let timeout = env::var("COLLECTOR_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(self.timeout);

        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(
                env::var("COLLECTOR_HTTP_POOL_MAX_IDLE_PER_HOST")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(8),
            )
            .pool_idle_timeout(Some(Duration::from_secs(
                env::var("COLLECTOR_HTTP_POOL_IDLE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(90),
            )));

        if let Ok(proxy_url) = env::var("COLLECTOR_PROXY_URL") {
            if let Ok(proxy) = Proxy::all(&proxy_url) {
                builder = builder.proxy(proxy);
            }
        }

        builder
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))
    }

    pub(crate) fn resolve_url(&self, target: &str) -> TransportResult<Url> {
        if let Ok(url) = Url::parse(target) {
            return Ok(url);
        }
        let base = self
            .base_url
            .as_ref()
            .ok_or_else(|| TransportError::Other(format!("relative target '{}' without a base URL", target)))?;
        let joined = format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            target.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| TransportError::Other(format!("invalid URL '{}': {}", joined, e)))
    }
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(timeout)
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Http(e)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn do_request(&self, request: TransportRequest) -> TransportResult<TransportResponse> {
        let client = self.client.load_full().ok_or(TransportError::NotConnected)?;
        let url = self.resolve_url(&request.target)?;

        let mut req = match request.method {
            Method::Get => client.get(url),
            Method::Post => client.post(url),
            Method::Put => client.put(url),
            Method::Patch => client.patch(url),
            Method::Delete => client.delete(url),
        };

        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        for (k, v) in self.default_headers.iter().chain(request.headers.iter()) {
            req = req.header(k.as_str(), v.as_str());
        }
        if !request.params.is_empty() {
            req = req.query(&request.params);
        }
        if let Some(body) = request.body {
            req = req.body(body);
        }

        let resp = req.send().await.map_err(|e| map_reqwest_error(e, self.timeout))?;
        let status = resp.status().as_u16();
        let mut headers = Headers::new();
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                headers
                    .entry(name.as_str().to_string())
                    .or_insert_with(|| v.to_string());
            }
        }
        let body = resp.bytes().await.map_err(|e| map_reqwest_error(e, self.timeout))?;
        debug!(
            transport = self.name.as_str(),
            http_status = status,
            body_len = body.len(),
            "http response received"
        );
        Ok(TransportResponse { status, headers, body })
    }

    async fn connect(&self) -> TransportResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let client = self.build_client()?;
        self.client.store(Some(Arc::new(client)));
        info!(
            transport = self.name.as_str(),
            base_url = self.base_url.as_ref().map(|u| u.as_str()).unwrap_or(""),
            "http transport connected"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        if self.client.swap(None).is_some() {
            info!(transport = self.name.as_str(), "http transport disconnected");
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
