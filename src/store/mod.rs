//! State store adapter: persistence of breaker and limiter state across restarts.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`StateBackend`] | Key-value boundary (`get`, `set` with TTL) |
//! | [`MemoryStore`] | In-process backend with TTL and bounded size |
//! | [`NullStore`] | Backend that persists nothing |
//! | [`StateStore`] | JSON snapshots, key prefixes, 24 h TTL, counters |
//!
//! Persistence only happens at connect/disconnect boundaries, never per request.
//! Failures are reported to the caller, which logs them and carries on with
//! in-memory state.

mod backend;
mod manager;

pub use backend::{MemoryStore, NullStore, StateBackend};
pub use manager::{StateStore, StateStoreConfig, StateStoreStats, DEFAULT_STATE_TTL};

pub fn breaker_key(collector: &str) -> String {
    format!("circuit_breaker:{}", collector)
}

pub fn limiter_key(collector: &str) -> String {
    format!("rate_limiter:{}", collector)
}
