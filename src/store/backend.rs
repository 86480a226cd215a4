//! Key-value backends the state store persists snapshots into.

use crate::Result;
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Key-value boundary with TTL support.
///
/// Production deployments back this with the shared cache used by the rest of
/// the platform; the core only needs `get` and `set`.
#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
    fn name(&self) -> &'static str;
}

struct Snapshot {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Snapshot {
    fn live_at(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process store bounded to `capacity` snapshots, least recently read
/// dropped first. Survives collector restarts within one process only.
pub struct MemoryStore {
    slots: Mutex<LruCache<String, Snapshot>>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn slots(&self) -> MutexGuard<'_, LruCache<String, Snapshot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live snapshots currently held.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots().iter().filter(|(_, s)| s.live_at(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl StateBackend for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut slots = self.slots();
        match slots.get(key) {
            Some(snap) if snap.live_at(now) => Ok(Some(snap.bytes.clone())),
            Some(_) => {
                slots.pop(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut slots = self.slots();
        // Expired snapshots go before a live one is pushed out.
        if !slots.contains(key) && slots.len() == slots.cap().get() {
            let stale: Vec<String> = slots
                .iter()
                .filter(|(_, s)| !s.live_at(now))
                .map(|(k, _)| k.clone())
                .collect();
            for k in stale {
                slots.pop(&k);
            }
        }
        slots.put(
            key.to_owned(),
            Snapshot {
                bytes: value.to_vec(),
                expires_at: now.checked_add(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.slots().pop(key).is_some())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Store that remembers nothing: collectors start fresh on every connect.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl NullStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StateBackend for NullStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_expires_entries() {
        let store = MemoryStore::new(8);
        store.set("k", b"v", Duration::from_millis(20)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn memory_store_evicts_least_recently_used() {
        let store = MemoryStore::new(2);
        let ttl = Duration::from_secs(60);
        store.set("a", b"1", ttl).await.unwrap();
        store.set("b", b"2", ttl).await.unwrap();
        store.get("a").await.unwrap();
        store.set("c", b"3", ttl).await.unwrap();
        assert!(store.get("a").await.unwrap().is_some());
        assert!(store.get("b").await.unwrap().is_none());
        assert!(store.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn full_store_drops_expired_snapshots_first() {
        let store = MemoryStore::new(2);
        store.set("short", b"1", Duration::from_millis(10)).await.unwrap();
        store.set("long", b"2", Duration::from_secs(60)).await.unwrap();
        store.get("short").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.set("new", b"3", Duration::from_secs(60)).await.unwrap();
        assert!(store.get("long").await.unwrap().is_some());
        assert!(store.get("new").await.unwrap().is_some());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn overwriting_a_key_does_not_evict() {
        let store = MemoryStore::new(2);
        let ttl = Duration::from_secs(60);
        store.set("a", b"1", ttl).await.unwrap();
        store.set("b", b"2", ttl).await.unwrap();
        store.set("a", b"3", ttl).await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a").await.unwrap(), Some(b"3".to_vec()));
        assert_eq!(store.get("b").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn null_store_forgets() {
        let store = NullStore;
        store.set("k", b"v", Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.delete("k").await.unwrap());
    }
}
