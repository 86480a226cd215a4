//! Collection scheduler: periodic execution, lifecycle and health.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Collector`] | User-supplied `collect_once` for one data source |
//! | [`CollectionScheduler`] | Owns the loop, breaker/limiter persistence and stats |
//! | [`HealthReport`] | Structured health surface for dashboards and alerting |
//! | [`CollectorGroup`] | Starts, stops and reports on many independent schedulers |
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use collector_resilience::client::ResilientClient;
//! use collector_resilience::collector::{CollectionReport, CollectionScheduler, Collector};
//! use collector_resilience::config::CollectorConfig;
//! use collector_resilience::store::{MemoryStore, StateStore};
//! use collector_resilience::transport::HttpTransport;
//! use std::sync::Arc;
//!
//! struct Ticker;
//!
//! #[async_trait]
//! impl Collector for Ticker {
//!     fn name(&self) -> &str {
//!         "binance"
//!     }
//!
//!     async fn collect_once(&self, client: &ResilientClient) -> anyhow::Result<CollectionReport> {
//!         let prices: Vec<serde_json::Value> = client.get_json("/api/v3/ticker/price", &[]).await?;
//!         Ok(CollectionReport::new(prices.len() as u64))
//!     }
//! }
//!
//! # async fn run() -> collector_resilience::Result<()> {
//! let config = CollectorConfig::new("binance").with_base_url("https://api.binance.com");
//! let scheduler = CollectionScheduler::builder(Arc::new(Ticker))
//!     .with_config(config.clone())
//!     .with_transport(Arc::new(HttpTransport::from_config(&config)?))
//!     .with_store(Arc::new(StateStore::with_backend(Arc::new(MemoryStore::default()))))
//!     .build()?;
//! scheduler.start().await?;
//! // ...
//! scheduler.stop().await?;
//! # Ok(())
//! # }
//! ```

mod group;
mod health;
mod scheduler;

pub use group::CollectorGroup;
pub use health::{CycleStats, HealthReport, HealthState};
pub use scheduler::{CollectionScheduler, CollectionSchedulerBuilder};

use crate::client::ResilientClient;
use async_trait::async_trait;

/// Outcome of one successful collection cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionReport {
    pub data_points: u64,
}

impl CollectionReport {
    pub fn new(data_points: u64) -> Self {
        Self { data_points }
    }
}

/// One data source. Errors and panics from `collect_once` are contained by
/// the scheduler and recorded as failed cycles.
#[async_trait]
pub trait Collector: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn collect_once(&self, client: &ResilientClient) -> anyhow::Result<CollectionReport>;
}
