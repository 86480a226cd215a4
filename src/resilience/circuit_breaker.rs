use crate::clock::{system_clock, Clock};
use crate::store::{breaker_key, StateStore};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed that open the circuit.
    pub failure_threshold: u32,
    /// Initial cooldown before an Open circuit admits a trial request.
    pub timeout_secs: f64,
    /// Trial request budget while HalfOpen.
    pub half_open_max_calls: u32,
    /// Successful trial requests required to close again.
    pub half_open_success_threshold: u32,
    /// Cooldown growth applied on every failed recovery.
    pub timeout_backoff_factor: f64,
    pub max_timeout_secs: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_secs: 60.0,
            half_open_max_calls: 3,
            half_open_success_threshold: 2,
            timeout_backoff_factor: 1.5,
            max_timeout_secs: 3600.0,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the initial cooldown in seconds
    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    pub fn with_half_open_success_threshold(mut self, successes: u32) -> Self {
        self.half_open_success_threshold = successes;
        self
    }
}

/// Cumulative counters. Never cleared, not even by [`CircuitBreaker::reset`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerStats {
    pub total_successes: u64,
    pub total_failures: u64,
    pub circuit_opened_count: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    pub total_open_time_secs: f64,
}

/// Flat, persistable view of the full mutable breaker state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub consecutive_successes: u32,
    pub timeout_secs: f64,
    pub last_failure_time: Option<f64>,
    pub last_state_change: Option<f64>,
    #[serde(default)]
    pub opened_at: Option<f64>,
    #[serde(default)]
    pub half_open_attempts: u32,
    #[serde(default)]
    pub half_open_successes: u32,
    #[serde(default)]
    pub stats: CircuitBreakerStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HalfOpenProgress {
    pub attempts: u32,
    pub max_calls: u32,
    pub successes: u32,
    pub success_threshold: u32,
}

/// Status report consumed by health checks and dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub collector: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub consecutive_successes: u32,
    pub timeout_secs: f64,
    pub last_failure_time: Option<f64>,
    pub last_state_change: Option<f64>,
    /// Seconds until an Open circuit admits a trial request again.
    pub time_until_retry_secs: Option<f64>,
    /// `successes / (successes + failures)`, 1.0 before any call.
    pub health_score: f64,
    pub half_open: Option<HalfOpenProgress>,
    pub stats: CircuitBreakerStats,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    consecutive_successes: u32,
    timeout_secs: f64,
    last_failure_time: Option<f64>,
    last_state_change: Option<f64>,
    opened_at: Option<f64>,
    half_open_attempts: u32,
    half_open_successes: u32,
    stats: CircuitBreakerStats,
}

impl Inner {
    fn new(cfg: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            consecutive_successes: 0,
            timeout_secs: cfg.timeout_secs,
            last_failure_time: None,
            last_state_change: None,
            opened_at: None,
            half_open_attempts: 0,
            half_open_successes: 0,
            stats: CircuitBreakerStats::default(),
        }
    }
}

/// Three-state failure detector owned by one collector.
///
/// - Closed: requests pass; `failure_threshold` consecutive failures open it
/// - Open: requests fail fast until `timeout_secs` has elapsed since the last failure
/// - HalfOpen: a bounded number of trial requests decide between Closed and Open
///
/// Each failed recovery multiplies the cooldown by `timeout_backoff_factor`
/// (capped at `max_timeout_secs`). A successful recovery leaves the grown
/// cooldown in place.
pub struct CircuitBreaker {
    name: String,
    cfg: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, cfg, system_clock())
    }

    pub fn with_clock(
        name: impl Into<String>,
        cfg: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let inner = Mutex::new(Inner::new(&cfg));
        Self {
            name: name.into(),
            cfg,
            clock,
            inner,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn timeout_secs(&self) -> f64 {
        self.lock().timeout_secs
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        self.lock().stats.clone()
    }

    /// Gate for the next request.
    ///
    /// In Open this performs the Open -> HalfOpen transition once the cooldown
    /// has elapsed; that transitioning call is permitted without consuming a
    /// half-open attempt.
    pub fn can_attempt(&self) -> bool {
        let now = self.clock.unix_now();
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = st.last_failure_time.map(|t| now - t);
                match elapsed {
                    Some(elapsed) if elapsed < st.timeout_secs => false,
                    _ => {
                        self.to_half_open(&mut st, now);
                        true
                    }
                }
            }
            CircuitState::HalfOpen => {
                if st.half_open_attempts < self.cfg.half_open_max_calls {
                    st.half_open_attempts += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let now = self.clock.unix_now();
        let mut st = self.lock();
        st.stats.total_successes += 1;
        match st.state {
            CircuitState::Closed => {
                st.failure_count = 0;
                st.consecutive_successes = st.consecutive_successes.saturating_add(1);
            }
            CircuitState::HalfOpen => {
                st.half_open_successes += 1;
                st.consecutive_successes = st.consecutive_successes.saturating_add(1);

                if st.half_open_successes >= self.cfg.half_open_success_threshold {
                    self.to_closed(&mut st, now, true);
                } else if st.half_open_attempts >= self.cfg.half_open_max_calls {
                    let ratio = st.half_open_successes as f64 / st.half_open_attempts as f64;
                    if ratio < 0.5 {
                        self.to_open(&mut st, now, true);
                    } else {
                        self.to_closed(&mut st, now, true);
                    }
                }
            }
            CircuitState::Open => {
                warn!(collector = %self.name, "success recorded while circuit is open");
            }
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.unix_now();
        let mut st = self.lock();
        st.stats.total_failures += 1;
        match st.state {
            CircuitState::Closed => {
                st.failure_count = st.failure_count.saturating_add(1);
                st.consecutive_successes = 0;
                st.last_failure_time = Some(now);
                debug!(
                    collector = %self.name,
                    failure_count = st.failure_count,
                    failure_threshold = self.cfg.failure_threshold,
                    "failure recorded"
                );
                if st.failure_count >= self.cfg.failure_threshold {
                    self.to_open(&mut st, now, false);
                }
            }
            CircuitState::HalfOpen => {
                st.consecutive_successes = 0;
                self.to_open(&mut st, now, true);
            }
            CircuitState::Open => {}
        }
    }

    fn to_open(&self, st: &mut Inner, now: f64, failed_recovery: bool) {
        if failed_recovery {
            st.stats.failed_recoveries += 1;
            st.timeout_secs =
                (st.timeout_secs * self.cfg.timeout_backoff_factor).min(self.cfg.max_timeout_secs);
        }
        let failure_count = st.failure_count;
        st.state = CircuitState::Open;
        st.failure_count = 0;
        st.consecutive_successes = 0;
        st.last_failure_time = Some(now);
        st.last_state_change = Some(now);
        st.opened_at = Some(now);
        st.half_open_attempts = 0;
        st.half_open_successes = 0;
        st.stats.circuit_opened_count += 1;
        warn!(
            collector = %self.name,
            failed_recovery,
            timeout_secs = st.timeout_secs,
            failure_count,
            "circuit opened"
        );
    }

    fn to_half_open(&self, st: &mut Inner, now: f64) {
        Self::accumulate_open_time(st, now);
        st.state = CircuitState::HalfOpen;
        st.failure_count = 0;
        st.consecutive_successes = 0;
        st.last_state_change = Some(now);
        st.half_open_attempts = 0;
        st.half_open_successes = 0;
        info!(collector = %self.name, "circuit half-open, probing for recovery");
    }

    fn to_closed(&self, st: &mut Inner, now: f64, recovered: bool) {
        Self::accumulate_open_time(st, now);
        if recovered {
            st.stats.successful_recoveries += 1;
        }
        st.state = CircuitState::Closed;
        st.failure_count = 0;
        st.consecutive_successes = 0;
        st.half_open_attempts = 0;
        st.half_open_successes = 0;
        st.last_state_change = Some(now);
        info!(
            collector = %self.name,
            recovered,
            timeout_secs = st.timeout_secs,
            "circuit closed"
        );
    }

    fn accumulate_open_time(st: &mut Inner, now: f64) {
        if let Some(opened_at) = st.opened_at.take() {
            st.stats.total_open_time_secs += (now - opened_at).max(0.0);
        }
    }

    /// Manually trip the circuit. The cooldown starts now.
    pub fn force_open(&self) {
        let now = self.clock.unix_now();
        let mut st = self.lock();
        if st.state != CircuitState::Open {
            self.to_open(&mut st, now, false);
        } else {
            st.last_failure_time = Some(now);
        }
    }

    pub fn force_close(&self) {
        let now = self.clock.unix_now();
        let mut st = self.lock();
        self.to_closed(&mut st, now, false);
    }

    /// Clear state and counters, keep cumulative statistics.
    pub fn reset(&self) {
        let now = self.clock.unix_now();
        let mut st = self.lock();
        Self::accumulate_open_time(&mut st, now);
        let stats = std::mem::take(&mut st.stats);
        *st = Inner::new(&self.cfg);
        st.stats = stats;
        st.last_state_change = Some(now);
        info!(collector = %self.name, "circuit breaker reset");
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let now = self.clock.unix_now();
        let st = self.lock();
        let total = st.stats.total_successes + st.stats.total_failures;
        let health_score = if total == 0 {
            1.0
        } else {
            st.stats.total_successes as f64 / total as f64
        };
        let time_until_retry_secs = match (st.state, st.last_failure_time) {
            (CircuitState::Open, Some(t)) => Some((st.timeout_secs - (now - t)).max(0.0)),
            _ => None,
        };
        let half_open = (st.state == CircuitState::HalfOpen).then(|| HalfOpenProgress {
            attempts: st.half_open_attempts,
            max_calls: self.cfg.half_open_max_calls,
            successes: st.half_open_successes,
            success_threshold: self.cfg.half_open_success_threshold,
        });
        CircuitBreakerStatus {
            collector: self.name.clone(),
            state: st.state,
            failure_count: st.failure_count,
            failure_threshold: self.cfg.failure_threshold,
            consecutive_successes: st.consecutive_successes,
            timeout_secs: st.timeout_secs,
            last_failure_time: st.last_failure_time,
            last_state_change: st.last_state_change,
            time_until_retry_secs,
            health_score,
            half_open,
            stats: st.stats.clone(),
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let st = self.lock();
        CircuitBreakerSnapshot {
            state: st.state,
            failure_count: st.failure_count,
            consecutive_successes: st.consecutive_successes,
            timeout_secs: st.timeout_secs,
            last_failure_time: st.last_failure_time,
            last_state_change: st.last_state_change,
            opened_at: st.opened_at,
            half_open_attempts: st.half_open_attempts,
            half_open_successes: st.half_open_successes,
            stats: st.stats.clone(),
        }
    }

    pub fn restore(&self, snap: CircuitBreakerSnapshot) {
        let mut st = self.lock();
        st.state = snap.state;
        st.failure_count = snap.failure_count;
        st.consecutive_successes = snap.consecutive_successes;
        st.timeout_secs = snap
            .timeout_secs
            .clamp(f64::MIN_POSITIVE, self.cfg.max_timeout_secs);
        st.last_failure_time = snap.last_failure_time;
        st.last_state_change = snap.last_state_change;
        st.opened_at = snap.opened_at;
        st.half_open_attempts = snap.half_open_attempts.min(self.cfg.half_open_max_calls);
        st.half_open_successes = snap.half_open_successes;
        st.stats = snap.stats;
    }

    /// Persist under `circuit_breaker:{name}`.
    pub async fn save_state(&self, store: &StateStore) -> Result<()> {
        let snap = self.snapshot();
        store.save(&breaker_key(&self.name), &snap).await?;
        debug!(collector = %self.name, state = %snap.state, "circuit breaker state saved");
        Ok(())
    }

    /// Restore from the store. Returns `false` when nothing was persisted.
    pub async fn load_state(&self, store: &StateStore) -> Result<bool> {
        match store
            .load::<CircuitBreakerSnapshot>(&breaker_key(&self.name))
            .await?
        {
            Some(snap) => {
                info!(
                    collector = %self.name,
                    state = %snap.state,
                    failure_count = snap.failure_count,
                    "circuit breaker state restored"
                );
                self.restore(snap);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(clock: &ManualClock) -> CircuitBreaker {
        let cfg = CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_timeout_secs(5.0)
            .with_half_open_max_calls(3)
            .with_half_open_success_threshold(2);
        CircuitBreaker::with_clock("test", cfg, Arc::new(clock.clone()))
    }

    fn trip(cb: &CircuitBreaker) {
        for _ in 0..cb.config().failure_threshold {
            cb.record_failure();
        }
    }

    #[test]
    fn test_circuit_breaker_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.timeout_secs, 60.0);
        assert_eq!(config.half_open_max_calls, 3);
        assert_eq!(config.half_open_success_threshold, 2);
    }

    #[test]
    fn test_threshold_opens_exactly_at_n() {
        for n in 1..=6u32 {
            let clock = ManualClock::new();
            let cb = CircuitBreaker::with_clock(
                "n",
                CircuitBreakerConfig::new().with_failure_threshold(n),
                Arc::new(clock.clone()),
            );
            for _ in 0..n - 1 {
                cb.record_failure();
            }
            assert_eq!(cb.state(), CircuitState::Closed, "n={}", n);
            cb.record_failure();
            assert_eq!(cb.state(), CircuitState::Open, "n={}", n);
        }
    }

    #[test]
    fn test_success_in_closed_resets_failure_count() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.status().failure_count, 2);
    }

    #[test]
    fn test_transitions_reset_counters() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        cb.record_success();
        trip(&cb);
        let status = cb.status();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.consecutive_successes, 0);

        clock.advance_secs(5.1);
        assert!(cb.can_attempt());
        let status = cb.status();
        assert_eq!(status.state, CircuitState::HalfOpen);
        assert_eq!((status.failure_count, status.consecutive_successes), (0, 0));

        cb.record_success();
        assert_eq!(cb.status().consecutive_successes, 1);
        assert!(cb.can_attempt());
        cb.record_success();
        let status = cb.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!((status.failure_count, status.consecutive_successes), (0, 0));

        // A fresh run of failures is needed to trip again.
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_cooldown_gate() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        trip(&cb);
        assert!(!cb.can_attempt());
        clock.advance_secs(4.9);
        assert!(!cb.can_attempt());
        assert_eq!(cb.state(), CircuitState::Open);
        clock.advance_secs(0.1);
        assert!(cb.can_attempt());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_recovery_scenario_closes_circuit() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        trip(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance_secs(5.1);
        assert!(cb.can_attempt());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(cb.can_attempt());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.can_attempt());
        cb.record_success();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().successful_recoveries, 1);
        assert!((cb.stats().total_open_time_secs - 5.1).abs() < 1e-6);
    }

    #[test]
    fn test_half_open_failure_reopens_with_backoff() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        trip(&cb);
        clock.advance_secs(5.1);
        assert!(cb.can_attempt());
        assert!(cb.can_attempt());
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Open);
        assert!((cb.timeout_secs() - 7.5).abs() < 1e-9);
        assert_eq!(cb.stats().failed_recoveries, 1);
        assert_eq!(cb.stats().circuit_opened_count, 2);
    }

    #[test]
    fn test_backoff_is_capped() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        trip(&cb);
        for _ in 0..40 {
            clock.advance_secs(cb.timeout_secs() + 0.01);
            assert!(cb.can_attempt());
            cb.record_failure();
            assert!(cb.timeout_secs() <= 3600.0);
        }
        assert_eq!(cb.timeout_secs(), 3600.0);
    }

    #[test]
    fn test_successful_recovery_keeps_grown_timeout() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        trip(&cb);
        clock.advance_secs(5.1);
        cb.can_attempt();
        cb.record_failure();
        clock.advance_secs(7.6);
        assert!(cb.can_attempt());
        cb.can_attempt();
        cb.record_success();
        cb.can_attempt();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!((cb.timeout_secs() - 7.5).abs() < 1e-9);
    }

    #[test]
    fn test_half_open_attempt_budget() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        trip(&cb);
        clock.advance_secs(6.0);
        assert!(cb.can_attempt());
        assert!(cb.can_attempt());
        assert!(cb.can_attempt());
        assert!(cb.can_attempt());
        assert!(!cb.can_attempt());
        let progress = cb.status().half_open.unwrap();
        assert_eq!(progress.attempts, 3);
        assert_eq!(progress.max_calls, 3);
    }

    #[test]
    fn test_exhausted_attempts_low_ratio_reopens() {
        let clock = ManualClock::new();
        let cfg = CircuitBreakerConfig::new()
            .with_failure_threshold(1)
            .with_timeout_secs(1.0)
            .with_half_open_max_calls(3)
            .with_half_open_success_threshold(3);
        let cb = CircuitBreaker::with_clock("ratio", cfg, Arc::new(clock.clone()));
        cb.record_failure();
        clock.advance_secs(1.0);
        assert!(cb.can_attempt());
        // Three trial requests go out but only one result comes back.
        assert!(cb.can_attempt());
        assert!(cb.can_attempt());
        assert!(cb.can_attempt());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().failed_recoveries, 1);
    }

    #[test]
    fn test_exhausted_attempts_high_ratio_closes() {
        let clock = ManualClock::new();
        let cfg = CircuitBreakerConfig::new()
            .with_failure_threshold(1)
            .with_timeout_secs(1.0)
            .with_half_open_max_calls(2)
            .with_half_open_success_threshold(3);
        let cb = CircuitBreaker::with_clock("ratio", cfg, Arc::new(clock.clone()));
        cb.record_failure();
        clock.advance_secs(1.0);
        assert!(cb.can_attempt());
        assert!(cb.can_attempt());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.can_attempt());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().successful_recoveries, 1);
    }

    #[test]
    fn test_failure_in_open_only_counts_stats() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        trip(&cb);
        let before = cb.status();
        clock.advance_secs(2.0);
        cb.record_failure();
        cb.record_success();
        let after = cb.status();
        assert_eq!(after.state, CircuitState::Open);
        assert_eq!(after.last_failure_time, before.last_failure_time);
        assert_eq!(after.stats.total_failures, before.stats.total_failures + 1);
        assert_eq!(after.stats.total_successes, before.stats.total_successes + 1);
    }

    #[test]
    fn test_reset_preserves_stats() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        cb.record_success();
        trip(&cb);
        let stats = cb.stats();
        cb.reset();
        let status = cb.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.stats.total_failures, stats.total_failures);
        assert_eq!(status.stats.total_successes, stats.total_successes);
        assert_eq!(status.stats.circuit_opened_count, 1);
    }

    #[test]
    fn test_force_open_and_close() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_attempt());
        cb.force_close();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_attempt());
        assert_eq!(cb.stats().successful_recoveries, 0);
    }

    #[test]
    fn test_health_score_and_retry_hint() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        assert_eq!(cb.status().health_score, 1.0);
        cb.record_success();
        cb.record_success();
        cb.record_success();
        trip(&cb);
        let status = cb.status();
        assert!((status.health_score - 0.5).abs() < 1e-9);
        clock.advance_secs(2.0);
        let remaining = cb.status().time_until_retry_secs.unwrap();
        assert!((remaining - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_stats_are_monotonic() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        let mut last = 0;
        for i in 0..50 {
            if i % 3 == 0 {
                cb.record_success();
            } else {
                cb.record_failure();
            }
            if i % 7 == 0 {
                cb.reset();
            }
            clock.advance_secs(1.0);
            cb.can_attempt();
            let s = cb.stats();
            let total = s.total_successes + s.total_failures;
            assert!(total > last);
            last = total;
        }
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let clock = ManualClock::new();
        let cb = breaker(&clock);
        trip(&cb);
        clock.advance_secs(5.5);
        cb.can_attempt();
        cb.record_failure();
        let snap = cb.snapshot();

        let fresh = breaker(&clock);
        fresh.restore(snap.clone());
        assert_eq!(fresh.snapshot(), snap);
        assert_eq!(fresh.state(), CircuitState::Open);
    }
}
