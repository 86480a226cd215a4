use super::health::{CycleStats, HealthReport, HealthState};
use super::{CollectionReport, Collector};
use crate::client::{ResilientClient, ResilientClientBuilder};
use crate::clock::{system_clock, Clock};
use crate::config::CollectorConfig;
use crate::events::{noop_sink, CollectorEvent, EventSink};
use crate::store::{StateBackend, StateStore, StateStoreConfig};
use crate::transport::Transport;
use crate::{Error, ErrorContext, Result};
use arc_swap::ArcSwap;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Grace period for the loop to observe cancellation before it is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// State shared between the scheduler handle and its loop task.
struct LoopContext {
    name: String,
    collector: Arc<dyn Collector>,
    client: Arc<ResilientClient>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    stats: ArcSwap<CycleStats>,
    interval: Duration,
}

struct RunningLoop {
    handle: JoinHandle<()>,
    token: CancellationToken,
}

#[derive(Default)]
struct Lifecycle {
    connected: bool,
    running: Option<RunningLoop>,
}

/// Drives one collector: connect/disconnect with state persistence, a
/// periodic `collect_once` loop, and health reporting.
pub struct CollectionScheduler {
    ctx: Arc<LoopContext>,
    store: Arc<StateStore>,
    config: CollectorConfig,
    lifecycle: Mutex<Lifecycle>,
    is_running: AtomicBool,
    is_connected: AtomicBool,
}

pub struct CollectionSchedulerBuilder {
    collector: Arc<dyn Collector>,
    config: Option<CollectorConfig>,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<StateStore>>,
    backend: Option<Arc<dyn StateBackend>>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl CollectionSchedulerBuilder {
    pub fn new(collector: Arc<dyn Collector>) -> Self {
        Self {
            collector,
            config: None,
            transport: None,
            store: None,
            backend: None,
            clock: system_clock(),
            events: noop_sink(),
        }
    }

    pub fn with_config(mut self, config: CollectorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a shared, preconfigured state store.
    pub fn with_store(mut self, store: Arc<StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Wrap a raw backend in a [`StateStore`] using the config's state TTL.
    pub fn with_backend(mut self, backend: Arc<dyn StateBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn build(self) -> Result<CollectionScheduler> {
        let name = self.collector.name().to_string();
        let mut config = self.config.unwrap_or_default();
        // The collector's own name keys persisted state and logs.
        config.name = name.clone();
        config.validate()?;

        let transport = self.transport.ok_or_else(|| missing("transport", &name))?;
        let store = match (self.store, self.backend) {
            (Some(store), _) => store,
            (None, Some(backend)) => Arc::new(StateStore::new(
                StateStoreConfig::new().with_ttl(config.state_ttl()),
                backend,
            )),
            (None, None) => return Err(missing("store", &name)),
        };

        let client = ResilientClientBuilder::from_config(&config)
            .with_transport(transport)
            .with_clock(self.clock.clone())
            .with_event_sink(self.events.clone())
            .build()?;

        let ctx = LoopContext {
            name,
            collector: self.collector,
            client: Arc::new(client),
            events: self.events,
            clock: self.clock,
            stats: ArcSwap::from_pointee(CycleStats::default()),
            interval: config.collection_interval(),
        };

        Ok(CollectionScheduler {
            ctx: Arc::new(ctx),
            store,
            config,
            lifecycle: Mutex::new(Lifecycle::default()),
            is_running: AtomicBool::new(false),
            is_connected: AtomicBool::new(false),
        })
    }
}

fn missing(what: &str, collector: &str) -> Error {
    Error::configuration_with_context(
        format!("a {} is required", what),
        ErrorContext::new()
            .with_field_path(what)
            .with_details(format!("collector '{}'", collector))
            .with_source("scheduler_builder"),
    )
}

impl CollectionScheduler {
    pub fn builder(collector: Arc<dyn Collector>) -> CollectionSchedulerBuilder {
        CollectionSchedulerBuilder::new(collector)
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<ResilientClient> {
        &self.ctx.client
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    pub fn cycle_stats(&self) -> CycleStats {
        CycleStats::clone(&self.ctx.stats.load())
    }

    /// Acquire the transport and restore breaker/limiter state.
    ///
    /// A transport failure is fatal; a state store failure is logged and the
    /// collector continues with fresh in-memory state.
    pub async fn connect(&self) -> Result<()> {
        let mut lc = self.lifecycle.lock().await;
        self.connect_locked(&mut lc).await
    }

    /// Persist breaker/limiter state and release the transport.
    pub async fn disconnect(&self) -> Result<()> {
        let mut lc = self.lifecycle.lock().await;
        self.disconnect_locked(&mut lc).await;
        Ok(())
    }

    /// Connect if needed and spawn the collection loop. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut lc = self.lifecycle.lock().await;
        if lc.running.is_some() {
            debug!(collector = self.name(), "start ignored, already running");
            return Ok(());
        }
        self.connect_locked(&mut lc).await?;

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_loop(self.ctx.clone(), token.clone()));
        lc.running = Some(RunningLoop { handle, token });
        self.is_running.store(true, Ordering::SeqCst);
        info!(
            collector = self.name(),
            interval_secs = self.ctx.interval.as_secs_f64(),
            "collector started"
        );
        Ok(())
    }

    /// Cancel the loop, wait for it to exit, then disconnect. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let mut lc = self.lifecycle.lock().await;
        if let Some(RunningLoop { mut handle, token }) = lc.running.take() {
            token.cancel();
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(())) => debug!(collector = self.name(), "collection loop exited"),
                Ok(Err(e)) => warn!(collector = self.name(), error = %e, "collection loop ended abnormally"),
                Err(_) => {
                    warn!(collector = self.name(), "collection loop ignored cancellation, aborting");
                    handle.abort();
                    let _ = handle.await;
                }
            }
            self.is_running.store(false, Ordering::SeqCst);
            info!(collector = self.name(), "collector stopped");
        }
        self.disconnect_locked(&mut lc).await;
        Ok(())
    }

    /// Run a single cycle outside the loop, with the same bookkeeping.
    pub async fn run_once(&self) -> Result<CollectionReport> {
        run_cycle(&self.ctx).await.map_err(|message| {
            Error::runtime_with_context(
                message,
                ErrorContext::new()
                    .with_details(format!("collector '{}'", self.name()))
                    .with_source("collect_once"),
            )
        })
    }

    pub async fn health_status(&self) -> HealthReport {
        let client = &self.ctx.client;
        let circuit_breaker = client.breaker().status();
        let rate_limiter = client.limiter().status().await;
        let requests = client.stats();
        let status = HealthState::classify(
            circuit_breaker.state,
            requests.successful_requests,
            requests.failed_requests,
        );
        HealthReport {
            collector: self.name().to_string(),
            healthy: status.is_healthy(),
            status,
            is_running: self.is_running(),
            circuit_breaker,
            rate_limiter,
            requests,
            cycles: self.cycle_stats(),
            timestamp: self.ctx.clock.unix_now(),
        }
    }

    async fn connect_locked(&self, lc: &mut Lifecycle) -> Result<()> {
        if lc.connected {
            return Ok(());
        }
        self.ctx.client.transport().connect().await?;

        if self.config.persist_state {
            let client = &self.ctx.client;
            match client.breaker().load_state(&self.store).await {
                Ok(true) => {}
                Ok(false) => debug!(collector = self.name(), "no persisted circuit breaker state"),
                Err(e) => warn!(collector = self.name(), error = %e, "failed to load circuit breaker state"),
            }
            match client.limiter().load_state(&self.store).await {
                Ok(true) => {}
                Ok(false) => debug!(collector = self.name(), "no persisted rate limiter state"),
                Err(e) => warn!(collector = self.name(), error = %e, "failed to load rate limiter state"),
            }
        }

        lc.connected = true;
        self.is_connected.store(true, Ordering::SeqCst);
        info!(
            collector = self.name(),
            transport = self.ctx.client.transport().name(),
            "collector connected"
        );
        Ok(())
    }

    async fn disconnect_locked(&self, lc: &mut Lifecycle) {
        if !lc.connected {
            return;
        }
        if self.config.persist_state {
            let client = &self.ctx.client;
            if let Err(e) = client.breaker().save_state(&self.store).await {
                warn!(collector = self.name(), error = %e, "failed to save circuit breaker state");
            }
            if let Err(e) = client.limiter().save_state(&self.store).await {
                warn!(collector = self.name(), error = %e, "failed to save rate limiter state");
            }
        }
        self.ctx.client.transport().disconnect().await;
        lc.connected = false;
        self.is_connected.store(false, Ordering::SeqCst);
        info!(collector = self.name(), "collector disconnected");
    }
}

impl Drop for CollectionScheduler {
    fn drop(&mut self) {
        if let Some(running) = self.lifecycle.get_mut().running.take() {
            running.token.cancel();
        }
    }
}

async fn run_loop(ctx: Arc<LoopContext>, token: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = run_cycle(&ctx) => {}
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ctx.clock.sleep(ctx.interval) => {}
        }
    }
    debug!(collector = ctx.name.as_str(), "collection loop cancelled");
}

async fn run_cycle(ctx: &LoopContext) -> std::result::Result<CollectionReport, String> {
    let started = ctx.clock.now();
    let outcome = AssertUnwindSafe(ctx.collector.collect_once(&ctx.client))
        .catch_unwind()
        .await;
    let duration_ms = ctx
        .clock
        .now()
        .duration_since(started)
        .unwrap_or_default()
        .as_millis() as u64;
    let now = ctx.clock.unix_now();

    let result = match outcome {
        Ok(Ok(report)) => Ok(report),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => Err(format!("collector panicked: {}", panic_message(panic.as_ref()))),
    };

    ctx.stats.rcu(|current| {
        let mut next = CycleStats::clone(current);
        next.total_cycles += 1;
        next.last_cycle_duration_ms = Some(duration_ms);
        match &result {
            Ok(report) => {
                next.successful_cycles += 1;
                next.data_points_collected += report.data_points;
                next.last_success_time = Some(now);
            }
            Err(message) => {
                next.failed_cycles += 1;
                next.last_error_time = Some(now);
                next.last_error = Some(message.clone());
            }
        }
        next
    });

    let event = match &result {
        Ok(report) => {
            debug!(
                collector = ctx.name.as_str(),
                data_points = report.data_points,
                duration_ms,
                "collection cycle completed"
            );
            CollectorEvent::CycleCompleted {
                collector: ctx.name.clone(),
                data_points: report.data_points,
                duration_ms,
                timestamp: now,
            }
        }
        Err(message) => {
            error!(
                collector = ctx.name.as_str(),
                error = message.as_str(),
                duration_ms,
                "collection cycle failed"
            );
            CollectorEvent::CycleFailed {
                collector: ctx.name.clone(),
                error: message.clone(),
                timestamp: now,
            }
        }
    };
    if let Err(e) = ctx.events.report(event).await {
        debug!(collector = ctx.name.as_str(), error = %e, "event sink rejected event");
    }
    result
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::{TransportRequest, TransportResponse, TransportResult};
    use async_trait::async_trait;

    struct OkTransport;

    #[async_trait]
    impl Transport for OkTransport {
        async fn do_request(&self, _: TransportRequest) -> TransportResult<TransportResponse> {
            Ok(TransportResponse::new(200))
        }
    }

    struct Flaky;

    #[async_trait]
    impl Collector for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn collect_once(&self, client: &ResilientClient) -> anyhow::Result<CollectionReport> {
            client.request("/ping").await?;
            anyhow::bail!("parse error in payload")
        }
    }

    struct Panicky;

    #[async_trait]
    impl Collector for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }
        async fn collect_once(&self, _: &ResilientClient) -> anyhow::Result<CollectionReport> {
            panic!("boom")
        }
    }

    fn scheduler(collector: Arc<dyn Collector>) -> CollectionScheduler {
        CollectionScheduler::builder(collector)
            .with_transport(Arc::new(OkTransport))
            .with_backend(Arc::new(MemoryStore::default()))
            .build()
            .unwrap()
    }

    #[test]
    fn missing_transport_or_store_is_a_configuration_error() {
        let err = CollectionScheduler::builder(Arc::new(Flaky))
            .with_backend(Arc::new(MemoryStore::default()))
            .build()
            .err()
            .unwrap();
        assert_eq!(err.context().and_then(|c| c.field_path.as_deref()), Some("transport"));

        let err = CollectionScheduler::builder(Arc::new(Flaky))
            .with_transport(Arc::new(OkTransport))
            .build()
            .err()
            .unwrap();
        assert_eq!(err.context().and_then(|c| c.field_path.as_deref()), Some("store"));
    }

    #[tokio::test]
    async fn failed_cycle_is_recorded_with_error_chain() {
        let s = scheduler(Arc::new(Flaky));
        let err = s.run_once().await.unwrap_err();
        assert!(err.to_string().contains("parse error in payload"));
        let stats = s.cycle_stats();
        assert_eq!(stats.total_cycles, 1);
        assert_eq!(stats.failed_cycles, 1);
        assert_eq!(stats.last_error.as_deref(), Some("parse error in payload"));
        assert_eq!(s.client().stats().successful_requests, 1);
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let s = scheduler(Arc::new(Panicky));
        let err = s.run_once().await.unwrap_err();
        assert!(err.to_string().contains("collector panicked: boom"));
        assert_eq!(s.cycle_stats().failed_cycles, 1);
    }

    #[tokio::test]
    async fn config_name_follows_collector() {
        let s = CollectionScheduler::builder(Arc::new(Flaky))
            .with_config(CollectorConfig::new("something-else"))
            .with_transport(Arc::new(OkTransport))
            .with_backend(Arc::new(MemoryStore::default()))
            .build()
            .unwrap();
        assert_eq!(s.name(), "flaky");
        assert_eq!(s.config().name, "flaky");
        assert_eq!(s.client().name(), "flaky");
    }
}
