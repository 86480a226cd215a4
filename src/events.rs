//! Collector lifecycle events and the sink they are reported to.
//!
//! Events are observations, not control flow: a failing sink never affects
//! collection. Richer sinks live in [`crate::telemetry`].

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CollectorEvent {
    CycleCompleted {
        collector: String,
        data_points: u64,
        duration_ms: u64,
        timestamp: f64,
    },
    CycleFailed {
        collector: String,
        error: String,
        timestamp: f64,
    },
    CircuitOpened {
        collector: String,
        failure_count: u32,
        timeout_secs: f64,
        timestamp: f64,
    },
    CircuitClosed {
        collector: String,
        timestamp: f64,
    },
    RateLimited {
        collector: String,
        endpoint: String,
        retry_after_secs: Option<f64>,
        timestamp: f64,
    },
    RequestRejected {
        collector: String,
        endpoint: String,
        retry_in_secs: Option<f64>,
        timestamp: f64,
    },
}

impl CollectorEvent {
    pub fn collector(&self) -> &str {
        match self {
            CollectorEvent::CycleCompleted { collector, .. }
            | CollectorEvent::CycleFailed { collector, .. }
            | CollectorEvent::CircuitOpened { collector, .. }
            | CollectorEvent::CircuitClosed { collector, .. }
            | CollectorEvent::RateLimited { collector, .. }
            | CollectorEvent::RequestRejected { collector, .. } => collector,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CollectorEvent::CycleCompleted { .. } => "cycle_completed",
            CollectorEvent::CycleFailed { .. } => "cycle_failed",
            CollectorEvent::CircuitOpened { .. } => "circuit_opened",
            CollectorEvent::CircuitClosed { .. } => "circuit_closed",
            CollectorEvent::RateLimited { .. } => "rate_limited",
            CollectorEvent::RequestRejected { .. } => "request_rejected",
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn report(&self, event: CollectorEvent) -> Result<()>;
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn report(&self, _: CollectorEvent) -> Result<()> {
        Ok(())
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoopEventSink)
}
