//! Typed collector configuration.
//!
//! One immutable [`CollectorConfig`] per collector, built programmatically
//! with `with_*` setters or loaded from YAML, with optional environment
//! overrides layered on top.

use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per logical call, including the first one.
    pub max_retries: u32,
    /// Base delay; attempt `n` (0-based) waits `retry_delay_secs * 2^n`.
    pub retry_delay_secs: f64,
    pub max_delay_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_secs: 1.0,
            max_delay_secs: 60.0,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_retry_delay_secs(mut self, secs: f64) -> Self {
        self.retry_delay_secs = secs;
        self
    }

    pub fn with_max_delay_secs(mut self, secs: f64) -> Self {
        self.max_delay_secs = secs;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub name: String,
    pub base_url: Option<String>,
    pub collection_interval_secs: f64,
    pub request_timeout_secs: f64,
    /// Load breaker/limiter state on connect and save it on disconnect.
    pub persist_state: bool,
    pub state_ttl_secs: u64,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limiter: RateLimiterConfig,
    pub retry: RetryConfig,
    pub default_headers: BTreeMap<String, String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            name: "collector".to_string(),
            base_url: None,
            collection_interval_secs: 60.0,
            request_timeout_secs: 30.0,
            persist_state: true,
            state_ttl_secs: 24 * 60 * 60,
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            retry: RetryConfig::default(),
            default_headers: BTreeMap::new(),
        }
    }
}

impl CollectorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Apply `{PREFIX}_*` environment variables on top of this config.
    pub fn with_env_overrides(self, prefix: &str) -> Result<Self> {
        self.with_overrides_from(prefix, |key| env::var(key).ok())
    }

    /// Same as [`with_env_overrides`](Self::with_env_overrides) with an arbitrary lookup.
    pub fn with_overrides_from<F>(mut self, prefix: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefix = prefix.trim_end_matches('_').to_ascii_uppercase();
        let get = |suffix: &str| -> Option<(String, String)> {
            let key = format!("{}_{}", prefix, suffix);
            lookup(&key).map(|v| (key, v))
        };

        if let Some((k, v)) = get("COLLECTION_INTERVAL_SECS") {
            self.collection_interval_secs = parse_override(&k, &v)?;
        }
        if let Some((k, v)) = get("REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_override(&k, &v)?;
        }
        if let Some((k, v)) = get("FAILURE_THRESHOLD") {
            self.circuit_breaker.failure_threshold = parse_override(&k, &v)?;
        }
        if let Some((k, v)) = get("BREAKER_TIMEOUT_SECS") {
            self.circuit_breaker.timeout_secs = parse_override(&k, &v)?;
        }
        if let Some((k, v)) = get("RATE") {
            let rate: f64 = parse_override(&k, &v)?;
            self.rate_limiter.default_rate = rate;
            self.rate_limiter.min_rate = self.rate_limiter.min_rate.min(rate);
            self.rate_limiter.max_rate = self.rate_limiter.max_rate.max(rate);
        }
        if let Some((k, v)) = get("MAX_RETRIES") {
            self.retry.max_retries = parse_override(&k, &v)?;
        }
        if let Some((k, v)) = get("RETRY_DELAY_SECS") {
            self.retry.retry_delay_secs = parse_override(&k, &v)?;
        }
        if let Some((_, v)) = get("BASE_URL") {
            self.base_url = Some(v.trim().to_string()).filter(|s| !s.is_empty());
        }
        Ok(self)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_collection_interval_secs(mut self, secs: f64) -> Self {
        self.collection_interval_secs = secs;
        self
    }

    pub fn with_request_timeout_secs(mut self, secs: f64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    pub fn with_persist_state(mut self, persist: bool) -> Self {
        self.persist_state = persist;
        self
    }

    pub fn with_circuit_breaker(mut self, cfg: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = cfg;
        self
    }

    pub fn with_rate_limiter(mut self, cfg: RateLimiterConfig) -> Self {
        self.rate_limiter = cfg;
        self
    }

    pub fn with_retry(mut self, cfg: RetryConfig) -> Self {
        self.retry = cfg;
        self
    }

    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    pub fn collection_interval(&self) -> Duration {
        secs_to_duration(self.collection_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        secs_to_duration(self.request_timeout_secs)
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("name", "collector name must not be empty"));
        }
        positive("collection_interval_secs", self.collection_interval_secs)?;
        positive("request_timeout_secs", self.request_timeout_secs)?;

        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be at least 1"));
        }
        positive("circuit_breaker.timeout_secs", cb.timeout_secs)?;
        if cb.half_open_max_calls == 0 {
            return Err(invalid("circuit_breaker.half_open_max_calls", "must be at least 1"));
        }
        if cb.half_open_success_threshold == 0 || cb.half_open_success_threshold > cb.half_open_max_calls {
            return Err(invalid(
                "circuit_breaker.half_open_success_threshold",
                format!("must be between 1 and half_open_max_calls ({})", cb.half_open_max_calls),
            ));
        }
        if !(cb.timeout_backoff_factor.is_finite() && cb.timeout_backoff_factor >= 1.0) {
            return Err(invalid("circuit_breaker.timeout_backoff_factor", "must be >= 1.0"));
        }
        if !(cb.max_timeout_secs.is_finite() && cb.max_timeout_secs >= cb.timeout_secs) {
            return Err(invalid("circuit_breaker.max_timeout_secs", "must be >= timeout_secs"));
        }

        let rl = &self.rate_limiter;
        positive("rate_limiter.min_rate", rl.min_rate)?;
        positive("rate_limiter.max_rate", rl.max_rate)?;
        positive("rate_limiter.default_rate", rl.default_rate)?;
        if rl.min_rate > rl.max_rate {
            return Err(invalid("rate_limiter.min_rate", "must not exceed max_rate"));
        }
        if rl.default_rate < rl.min_rate || rl.default_rate > rl.max_rate {
            return Err(invalid(
                "rate_limiter.default_rate",
                format!("must lie within [{}, {}]", rl.min_rate, rl.max_rate),
            ));
        }
        if !(rl.backoff_factor.is_finite() && rl.backoff_factor >= 1.0) {
            return Err(invalid("rate_limiter.backoff_factor", "must be >= 1.0"));
        }
        if !(rl.decrease_factor > 0.0 && rl.decrease_factor <= 1.0) {
            return Err(invalid("rate_limiter.decrease_factor", "must lie within (0, 1]"));
        }
        positive("rate_limiter.max_block_secs", rl.max_block_secs)?;
        if rl.max_tracked_endpoints == 0 {
            return Err(invalid("rate_limiter.max_tracked_endpoints", "must be at least 1"));
        }

        if self.retry.max_retries == 0 {
            return Err(invalid("retry.max_retries", "must be at least 1 (total attempts)"));
        }
        if !(self.retry.retry_delay_secs.is_finite() && self.retry.retry_delay_secs >= 0.0) {
            return Err(invalid("retry.retry_delay_secs", "must be a non-negative number"));
        }
        if !(self.retry.max_delay_secs.is_finite() && self.retry.max_delay_secs >= 0.0) {
            return Err(invalid("retry.max_delay_secs", "must be a non-negative number"));
        }

        if let Some(ref base) = self.base_url {
            Url::parse(base).map_err(|e| invalid("base_url", format!("unparseable URL '{}': {}", base, e)))?;
        }
        Ok(())
    }
}

fn invalid(field: &str, msg: impl Into<String>) -> Error {
    Error::configuration_with_context(
        msg,
        ErrorContext::new()
            .with_field_path(field)
            .with_source("config_validator"),
    )
}

/// Non-finite or non-positive input maps to zero; oversized input saturates.
fn secs_to_duration(v: f64) -> Duration {
    if v.is_finite() && v > 0.0 {
        Duration::try_from_secs_f64(v).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

fn positive(field: &str, v: f64) -> Result<()> {
    if v.is_finite() && v > 0.0 {
        Ok(())
    } else {
        Err(invalid(field, format!("must be a positive number, got {}", v)))
    }
}

fn parse_override<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        Error::configuration_with_context(
            format!("cannot parse '{}'", raw),
            ErrorContext::new()
                .with_field_path(key)
                .with_source("env_override"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let cfg = CollectorConfig::new("binance");
        cfg.validate().unwrap();
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.state_ttl(), Duration::from_secs(86_400));
    }

    #[test]
    fn yaml_partial_document_fills_defaults() {
        let cfg = CollectorConfig::from_yaml_str(
            r#"
name: coingecko
base_url: https://api.coingecko.com/api/v3
collection_interval_secs: 15
circuit_breaker:
  failure_threshold: 3
  timeout_secs: 5
rate_limiter:
  default_rate: 0.5
"#,
        )
        .unwrap();
        assert_eq!(cfg.name, "coingecko");
        assert_eq!(cfg.collection_interval_secs, 15.0);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 3);
        assert_eq!(cfg.circuit_breaker.half_open_max_calls, 3);
        assert_eq!(cfg.rate_limiter.default_rate, 0.5);
        assert_eq!(cfg.rate_limiter.max_rate, 10.0);
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = CollectorConfig::from_yaml_str("name: [unclosed").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn validation_reports_field_path() {
        let cfg = CollectorConfig::new("x").with_circuit_breaker(
            CircuitBreakerConfig::new()
                .with_half_open_max_calls(2)
                .with_half_open_success_threshold(3),
        );
        let err = cfg.validate().unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("circuit_breaker.half_open_success_threshold")
        );

        let cfg = CollectorConfig::new("x").with_rate_limiter(RateLimiterConfig::new().with_bounds(5.0, 1.0));
        assert!(cfg.validate().is_err());

        let cfg = CollectorConfig::new("x").with_retry(RetryConfig::new().with_max_retries(0));
        assert!(cfg.validate().is_err());

        let cfg = CollectorConfig::new("x").with_base_url("::nope::");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overrides_apply_and_widen_rate_bounds() {
        let vars: HashMap<&str, &str> = [
            ("KRAKEN_FAILURE_THRESHOLD", "7"),
            ("KRAKEN_RATE", "20"),
            ("KRAKEN_RETRY_DELAY_SECS", "0.25"),
            ("KRAKEN_BASE_URL", "https://api.kraken.com"),
        ]
        .into_iter()
        .collect();
        let cfg = CollectorConfig::new("kraken")
            .with_overrides_from("kraken", |k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.circuit_breaker.failure_threshold, 7);
        assert_eq!(cfg.rate_limiter.default_rate, 20.0);
        assert_eq!(cfg.rate_limiter.max_rate, 20.0);
        assert_eq!(cfg.retry.retry_delay_secs, 0.25);
        assert_eq!(cfg.base_url.as_deref(), Some("https://api.kraken.com"));
        cfg.validate().unwrap();
    }

    #[test]
    fn unparseable_override_is_rejected() {
        let err = CollectorConfig::new("k")
            .with_overrides_from("K_", |k| (k == "K_MAX_RETRIES").then(|| "many".to_string()))
            .unwrap_err();
        assert_eq!(err.context().and_then(|c| c.field_path.as_deref()), Some("K_MAX_RETRIES"));
    }
}
