use super::health::HealthReport;
use super::scheduler::CollectionScheduler;
use crate::Result;
use futures::future::join_all;
use std::sync::Arc;
use tracing::warn;

/// A set of independent collectors managed together.
///
/// Collectors share nothing: each keeps its own breaker, limiter and loop.
/// Group operations fan out concurrently and one collector's failure never
/// prevents the others from starting or stopping.
#[derive(Default)]
pub struct CollectorGroup {
    schedulers: Vec<Arc<CollectionScheduler>>,
}

impl CollectorGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scheduler(mut self, scheduler: Arc<CollectionScheduler>) -> Self {
        self.schedulers.push(scheduler);
        self
    }

    pub fn push(&mut self, scheduler: Arc<CollectionScheduler>) {
        self.schedulers.push(scheduler);
    }

    pub fn len(&self) -> usize {
        self.schedulers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedulers.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CollectionScheduler>> {
        self.schedulers.iter().find(|s| s.name() == name)
    }

    pub fn schedulers(&self) -> &[Arc<CollectionScheduler>] {
        &self.schedulers
    }

    /// Start every collector. Returns the first error after all attempts finished.
    pub async fn start_all(&self) -> Result<()> {
        let results = join_all(self.schedulers.iter().map(|s| s.start())).await;
        self.first_error(results, "start")
    }

    pub async fn stop_all(&self) -> Result<()> {
        let results = join_all(self.schedulers.iter().map(|s| s.stop())).await;
        self.first_error(results, "stop")
    }

    pub async fn health(&self) -> Vec<HealthReport> {
        join_all(self.schedulers.iter().map(|s| s.health_status())).await
    }

    pub async fn all_healthy(&self) -> bool {
        self.health().await.iter().all(|r| r.healthy)
    }

    fn first_error(&self, results: Vec<Result<()>>, op: &str) -> Result<()> {
        let mut first = None;
        for (scheduler, result) in self.schedulers.iter().zip(results) {
            if let Err(e) = result {
                warn!(collector = scheduler.name(), operation = op, error = %e, "collector group operation failed");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
