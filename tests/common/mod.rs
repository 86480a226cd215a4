//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use collector_resilience::clock::ManualClock;
use collector_resilience::collector::{CollectionReport, Collector};
use collector_resilience::store::StateBackend;
use collector_resilience::transport::{
    Transport, TransportError, TransportRequest, TransportResponse, TransportResult,
};
use collector_resilience::{Error, ErrorContext, ResilientClient};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub enum Step {
    Status(u16),
    StatusWithHeaders(u16, Vec<(&'static str, &'static str)>),
    Error(fn() -> TransportError),
    /// Advance the manual clock before answering 200, simulating latency.
    Slow(Duration),
}

/// In-memory transport answering from a script; 200 once the script is exhausted.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<(f64, TransportRequest)>>,
    clock: Option<ManualClock>,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Self::build(steps, None)
    }

    pub fn with_clock(steps: Vec<Step>, clock: &ManualClock) -> Arc<Self> {
        Self::build(steps, Some(clock.clone()))
    }

    fn build(steps: Vec<Step>, clock: Option<ManualClock>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
            clock,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Unix timestamps (from the manual clock) at which requests arrived.
    pub fn call_times(&self) -> Vec<f64> {
        self.requests.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn targets(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.target.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn do_request(&self, request: TransportRequest) -> TransportResult<TransportResponse> {
        use collector_resilience::clock::Clock;
        let now = self.clock.as_ref().map(|c| c.unix_now()).unwrap_or(0.0);
        self.requests.lock().unwrap().push((now, request));
        let step = self.script.lock().unwrap().pop_front();
        match step {
            None => Ok(TransportResponse::new(200).with_body("{}")),
            Some(Step::Status(code)) => Ok(TransportResponse::new(code)),
            Some(Step::StatusWithHeaders(code, headers)) => {
                let mut resp = TransportResponse::new(code);
                for (k, v) in headers {
                    resp = resp.with_header(k, v);
                }
                Ok(resp)
            }
            Some(Step::Error(make)) => Err(make()),
            Some(Step::Slow(latency)) => {
                if let Some(clock) = &self.clock {
                    clock.advance(latency);
                }
                Ok(TransportResponse::new(200))
            }
        }
    }

    async fn connect(&self) -> TransportResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Collector issuing one GET per cycle and counting its cycles.
pub struct CountingCollector {
    name: String,
    endpoint: String,
    pub cycles: AtomicU64,
    data_points: u64,
}

impl CountingCollector {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            endpoint: "/prices".to_string(),
            cycles: AtomicU64::new(0),
            data_points: 10,
        })
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Collector for CountingCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect_once(&self, client: &ResilientClient) -> anyhow::Result<CollectionReport> {
        self.cycles.fetch_add(1, Ordering::SeqCst);
        client.request(&self.endpoint).await?;
        Ok(CollectionReport::new(self.data_points))
    }
}

/// Backend that is always unreachable.
pub struct UnreachableBackend;

#[async_trait]
impl StateBackend for UnreachableBackend {
    async fn get(&self, _: &str) -> collector_resilience::Result<Option<Vec<u8>>> {
        Err(Error::runtime_with_context("connection refused", ErrorContext::new()))
    }
    async fn set(&self, _: &str, _: &[u8], _: Duration) -> collector_resilience::Result<()> {
        Err(Error::runtime_with_context("connection refused", ErrorContext::new()))
    }
    async fn delete(&self, _: &str) -> collector_resilience::Result<bool> {
        Ok(false)
    }
    fn name(&self) -> &'static str {
        "unreachable"
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
