//! Logging bootstrap and event sinks.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`init_tracing`] | Installs a `tracing-subscriber` fmt subscriber honouring `RUST_LOG` |
//! | [`CollectorEvent`] | Typed lifecycle event |
//! | [`EventSink`] | Trait for event destinations |
//! | [`NoopEventSink`] | Default sink, drops everything |
//! | [`InMemoryEventSink`] | Bounded in-memory sink for tests |
//! | [`TracingEventSink`] | Forwards events as structured log lines |
//! | [`CompositeEventSink`] | Fans out to several sinks |

pub use crate::events::{noop_sink, CollectorEvent, EventSink, NoopEventSink};

use crate::Result;
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber. `RUST_LOG` wins over `default_directive`.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// In-memory sink for testing.
pub struct InMemoryEventSink {
    events: Arc<RwLock<Vec<CollectorEvent>>>,
    max_events: usize,
}

impl InMemoryEventSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            max_events: max.max(1),
        }
    }
    pub fn events(&self) -> Vec<CollectorEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
    pub fn events_of_kind(&self, kind: &str) -> Vec<CollectorEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }
    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn report(&self, event: CollectorEvent) -> Result<()> {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        events.push(event);
        if events.len() > self.max_events {
            events.remove(0);
        }
        Ok(())
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn report(&self, event: CollectorEvent) -> Result<()> {
        match &event {
            CollectorEvent::CycleFailed { collector, error, .. } => {
                warn!(collector = collector.as_str(), error = error.as_str(), "collection cycle failed")
            }
            CollectorEvent::CircuitOpened {
                collector,
                failure_count,
                timeout_secs,
                ..
            } => warn!(
                collector = collector.as_str(),
                failure_count = *failure_count,
                timeout_secs = *timeout_secs,
                "circuit opened"
            ),
            CollectorEvent::RateLimited {
                collector,
                endpoint,
                retry_after_secs,
                ..
            } => warn!(
                collector = collector.as_str(),
                endpoint = endpoint.as_str(),
                retry_after_secs = retry_after_secs.unwrap_or(0.0),
                "rate limited by upstream"
            ),
            other => info!(collector = other.collector(), event = other.kind(), "collector event"),
        }
        Ok(())
    }
}

/// Composite sink for multiple destinations.
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }
    pub fn add_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Default for CompositeEventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for CompositeEventSink {
    async fn report(&self, event: CollectorEvent) -> Result<()> {
        for s in &self.sinks {
            let _ = s.report(event.clone()).await;
        }
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        for s in &self.sinks {
            let _ = s.close().await;
        }
        Ok(())
    }
}
