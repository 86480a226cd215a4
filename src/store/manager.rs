//! Typed snapshot persistence on top of a [`StateBackend`].

use super::backend::StateBackend;
use crate::{Error, ErrorContext, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Persisted breaker/limiter state lives for a day.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct StateStoreConfig {
    pub ttl: Duration,
    pub key_prefix: Option<String>,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_STATE_TTL, key_prefix: None }
    }
}

impl StateStoreConfig {
    pub fn new() -> Self { Self::default() }
    pub fn with_ttl(mut self, ttl: Duration) -> Self { self.ttl = ttl; self }
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self { self.key_prefix = Some(prefix.into()); self }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateStoreStats { pub hits: u64, pub misses: u64, pub saves: u64, pub errors: u64 }

struct AtomicStats { hits: AtomicU64, misses: AtomicU64, saves: AtomicU64, errors: AtomicU64 }
impl AtomicStats {
    fn new() -> Self { Self { hits: AtomicU64::new(0), misses: AtomicU64::new(0), saves: AtomicU64::new(0), errors: AtomicU64::new(0) } }
    fn to_stats(&self) -> StateStoreStats { StateStoreStats { hits: self.hits.load(Ordering::Relaxed), misses: self.misses.load(Ordering::Relaxed), saves: self.saves.load(Ordering::Relaxed), errors: self.errors.load(Ordering::Relaxed) } }
}

/// JSON snapshots keyed by collector, written with a TTL.
pub struct StateStore { config: StateStoreConfig, backend: Arc<dyn StateBackend>, stats: Arc<AtomicStats> }

impl StateStore {
    pub fn new(config: StateStoreConfig, backend: Arc<dyn StateBackend>) -> Self { Self { config, backend, stats: Arc::new(AtomicStats::new()) } }

    pub fn with_backend(backend: Arc<dyn StateBackend>) -> Self { Self::new(StateStoreConfig::default(), backend) }

    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let key = self.prefix_key(key);
        match self.backend.get(&key).await {
            Ok(Some(data)) => match serde_json::from_slice(&data) {
                Ok(val) => { self.stats.hits.fetch_add(1, Ordering::Relaxed); Ok(Some(val)) }
                Err(e) => {
                    // A snapshot from an incompatible version is treated as absent.
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(key = key.as_str(), error = %e, "discarding unreadable state snapshot");
                    Ok(None)
                }
            },
            Ok(None) => { self.stats.misses.fetch_add(1, Ordering::Relaxed); Ok(None) }
            Err(e) => { self.stats.errors.fetch_add(1, Ordering::Relaxed); Err(wrap(e, "load", &key)) }
        }
    }

    pub async fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> { self.save_with_ttl(key, value, self.config.ttl).await }

    pub async fn save_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let data = serde_json::to_vec(value)?;
        let key = self.prefix_key(key);
        match self.backend.set(&key, &data, ttl).await {
            Ok(()) => { self.stats.saves.fetch_add(1, Ordering::Relaxed); Ok(()) }
            Err(e) => { self.stats.errors.fetch_add(1, Ordering::Relaxed); Err(wrap(e, "save", &key)) }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let key = self.prefix_key(key);
        self.backend.delete(&key).await.map_err(|e| wrap(e, "delete", &key))
    }

    pub fn ttl(&self) -> Duration { self.config.ttl }
    pub fn stats(&self) -> StateStoreStats { self.stats.to_stats() }
    pub fn backend_name(&self) -> &'static str { self.backend.name() }

    fn prefix_key(&self, key: &str) -> String {
        match self.config.key_prefix { Some(ref p) => format!("{}:{}", p, key), None => key.to_string() }
    }
}

fn wrap(err: Error, op: &str, key: &str) -> Error {
    match err {
        Error::Store { .. } => err,
        other => Error::store_with_context(
            other.to_string(),
            ErrorContext::new().with_field_path(key).with_source(format!("state_store.{}", op)),
        ),
    }
}
