use crate::clock::{system_clock, Clock};
use crate::store::{limiter_key, StateStore};
use crate::transport::{header_first, Headers};
use crate::Result;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Key used when a request is not attributed to a specific endpoint.
pub const GLOBAL_ENDPOINT: &str = "*";

/// Reset values above this are epoch timestamps rather than delta seconds.
const EPOCH_THRESHOLD_SECS: f64 = 1_000_000_000.0;

/// Waits shorter than this are treated as already elapsed.
const WAIT_EPSILON_SECS: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Starting rate in requests per second.
    pub default_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    /// Fraction of the gap to `max_rate` recovered per increase step.
    pub increase_gain: f64,
    /// Floor of the multiplicative decrease applied on slow responses or 5xx.
    pub decrease_factor: f64,
    /// Growth of `backoff_multiplier` per 429.
    pub backoff_factor: f64,
    pub max_backoff: f64,
    /// Per-success decay of `backoff_multiplier` toward 1.
    pub backoff_decay: f64,
    pub fast_latency_secs: f64,
    pub slow_latency_secs: f64,
    /// Fast successes in a row required before the rate is raised.
    pub increase_after_successes: u32,
    /// Remaining/limit ratio under which the rate is tightened proactively.
    pub low_quota_ratio: f64,
    /// Block applied after a 429 without `Retry-After`, scaled by the backoff multiplier.
    pub default_cooldown_secs: f64,
    /// Upper bound on any upstream-supplied block (`Retry-After`, quota reset).
    pub max_block_secs: f64,
    pub max_tracked_endpoints: usize,
    pub remaining_headers: Vec<String>,
    pub limit_headers: Vec<String>,
    pub reset_headers: Vec<String>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default_rate: 1.0,
            min_rate: 0.05,
            max_rate: 10.0,
            increase_gain: 0.1,
            decrease_factor: 0.8,
            backoff_factor: 2.0,
            max_backoff: 32.0,
            backoff_decay: 0.9,
            fast_latency_secs: 0.5,
            slow_latency_secs: 2.0,
            increase_after_successes: 5,
            low_quota_ratio: 0.1,
            default_cooldown_secs: 1.0,
            max_block_secs: 3600.0,
            max_tracked_endpoints: 256,
            remaining_headers: vec![
                "x-ratelimit-remaining".into(),
                "x-rate-limit-remaining".into(),
                "ratelimit-remaining".into(),
                "x-ratelimit-remaining-requests".into(),
            ],
            limit_headers: vec![
                "x-ratelimit-limit".into(),
                "x-rate-limit-limit".into(),
                "ratelimit-limit".into(),
                "x-ratelimit-limit-requests".into(),
            ],
            reset_headers: vec![
                "x-ratelimit-reset".into(),
                "x-rate-limit-reset".into(),
                "ratelimit-reset".into(),
                "x-ratelimit-reset-requests".into(),
            ],
        }
    }
}

impl RateLimiterConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps <= 0.0 {
            return None;
        }
        let cfg = Self::default();
        Some(Self {
            default_rate: rps,
            min_rate: cfg.min_rate.min(rps),
            max_rate: cfg.max_rate.max(rps),
            ..cfg
        })
    }

    pub fn with_default_rate(mut self, rate: f64) -> Self {
        self.default_rate = rate;
        self
    }

    pub fn with_bounds(mut self, min_rate: f64, max_rate: f64) -> Self {
        self.min_rate = min_rate;
        self.max_rate = max_rate;
        self
    }

    pub fn with_increase_after_successes(mut self, n: u32) -> Self {
        self.increase_after_successes = n;
        self
    }

    pub fn with_max_block_secs(mut self, secs: f64) -> Self {
        self.max_block_secs = secs;
        self
    }

    pub fn with_max_tracked_endpoints(mut self, n: usize) -> Self {
        self.max_tracked_endpoints = n;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub rate_limit_hits: u64,
    pub rate_increases: u64,
    pub rate_decreases: u64,
    pub proactive_throttles: u64,
    pub total_wait_secs: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSnapshot {
    pub last_request: Option<f64>,
    pub blocked_until: Option<f64>,
    pub remaining: Option<u64>,
    pub limit: Option<u64>,
    pub reset_at: Option<f64>,
    pub requests: u64,
    pub rate_limit_hits: u64,
}

/// Persistable limiter state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterSnapshot {
    pub current_rate: f64,
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub success_streak: u32,
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointSnapshot>,
    #[serde(default)]
    pub stats: RateLimiterStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub endpoint: String,
    pub remaining: Option<u64>,
    pub limit: Option<u64>,
    pub blocked_for_secs: Option<f64>,
    pub requests: u64,
    pub rate_limit_hits: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterStatus {
    pub collector: String,
    pub current_rate: f64,
    /// `current_rate / backoff_multiplier`: the rate `wait` actually enforces.
    pub effective_rate: f64,
    pub backoff_multiplier: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub endpoints: Vec<EndpointStatus>,
    pub stats: RateLimiterStats,
}

type EndpointState = EndpointSnapshot;

impl EndpointSnapshot {
    /// Whether a `Retry-After` block or an exhausted quota is still pending.
    fn holds_deadline(&self, now: f64) -> bool {
        let blocked = self.blocked_until.is_some_and(|b| b > now);
        let exhausted = matches!((self.remaining, self.reset_at), (Some(0), Some(reset)) if reset > now);
        blocked || exhausted
    }
}

#[derive(Debug)]
struct State {
    current_rate: f64,
    backoff_multiplier: f64,
    success_streak: u32,
    endpoints: LruCache<String, EndpointState>,
    stats: RateLimiterStats,
}

impl State {
    fn effective_rate(&self, cfg: &RateLimiterConfig) -> f64 {
        (self.current_rate / self.backoff_multiplier).max(cfg.min_rate / cfg.max_backoff)
    }

    /// Entry for `key`, created if needed. Eviction skips endpoints that still
    /// hold a deadline; the table grows past `max` while all of them do.
    fn endpoint(&mut self, key: &str, now: f64, max: usize) -> &mut EndpointState {
        if !self.endpoints.contains(key) {
            self.make_room(now, max.max(1));
        }
        self.endpoints
            .get_or_insert_mut(key.to_string(), EndpointState::default)
    }

    fn make_room(&mut self, now: f64, max: usize) {
        while self.endpoints.len() >= max {
            let victim = self
                .endpoints
                .iter()
                .rev()
                .find(|(_, ep)| !ep.holds_deadline(now))
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    self.endpoints.pop(&k);
                }
                None => break,
            }
        }
        let len = self.endpoints.len();
        let cap = self.endpoints.cap().get();
        if len >= cap {
            if let Some(grown) = NonZeroUsize::new(len + 1) {
                self.endpoints.resize(grown);
            }
        } else if len < max && cap > max {
            if let Some(bound) = NonZeroUsize::new(max) {
                self.endpoints.resize(bound);
            }
        }
    }
}

/// Seconds to a `Duration`, saturating instead of panicking on huge or invalid input.
fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Adaptive per-collector throttle.
///
/// The permitted rate is a control variable: proactive quota headers and
/// reactive 429/latency feedback move it between `min_rate` and `max_rate`.
/// Spacing is tracked per endpoint; a `Retry-After` deadline blocks only the
/// endpoint that received it.
pub struct RateLimiter {
    name: String,
    cfg: RateLimiterConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

fn endpoint_key(endpoint: Option<&str>) -> &str {
    match endpoint {
        Some(e) if !e.is_empty() => e,
        _ => GLOBAL_ENDPOINT,
    }
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, cfg: RateLimiterConfig) -> Self {
        Self::with_clock(name, cfg, system_clock())
    }

    pub fn with_clock(name: impl Into<String>, cfg: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(cfg.max_tracked_endpoints.max(1)).unwrap_or(NonZeroUsize::MIN);
        let state = Mutex::new(State {
            current_rate: cfg.default_rate.clamp(cfg.min_rate, cfg.max_rate),
            backoff_multiplier: 1.0,
            success_streak: 0,
            endpoints: LruCache::new(capacity),
            stats: RateLimiterStats::default(),
        });
        Self {
            name: name.into(),
            cfg,
            clock,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    /// Suspend until the next request to `endpoint` is permitted.
    ///
    /// Returns the total time spent waiting.
    pub async fn wait(&self, endpoint: Option<&str>) -> Duration {
        let key = endpoint_key(endpoint);
        let mut waited = Duration::ZERO;

        loop {
            let wait_secs = {
                let mut st = self.state.lock().await;
                let now = self.clock.unix_now();
                let interval = 1.0 / st.effective_rate(&self.cfg);
                let ep = st.endpoint(key, now, self.cfg.max_tracked_endpoints);

                let quota_reset = match (ep.remaining, ep.reset_at) {
                    (Some(0), Some(reset)) => Some(reset),
                    _ => None,
                };
                let spacing = ep.last_request.map(|last| last + interval);
                let until = [ep.blocked_until, quota_reset, spacing]
                    .into_iter()
                    .flatten()
                    .fold(now, f64::max);

                match until - now {
                    remaining if remaining > WAIT_EPSILON_SECS => remaining,
                    _ => {
                        ep.blocked_until = None;
                        ep.last_request = Some(now);
                        ep.requests += 1;
                        if let Some(rem) = ep.remaining.as_mut() {
                            *rem = rem.saturating_sub(1);
                        }
                        st.stats.total_requests += 1;
                        st.stats.total_wait_secs += waited.as_secs_f64();
                        return waited;
                    }
                }
            };

            let pause = secs_to_duration(wait_secs.min(self.max_block_secs()));
            debug!(collector = %self.name, endpoint = key, wait_ms = pause.as_millis() as u64, "rate limiter wait");
            self.clock.sleep(pause).await;
            waited += pause;
        }
    }

    /// Time until `endpoint` would be permitted, without consuming a slot.
    pub async fn estimated_wait(&self, endpoint: Option<&str>) -> Duration {
        let key = endpoint_key(endpoint);
        let mut st = self.state.lock().await;
        let now = self.clock.unix_now();
        let interval = 1.0 / st.effective_rate(&self.cfg);
        let Some(ep) = st.endpoints.peek(key) else {
            return Duration::ZERO;
        };
        let mut until = ep.last_request.map(|l| l + interval).unwrap_or(now);
        if let Some(b) = ep.blocked_until {
            until = until.max(b);
        }
        if let (Some(0), Some(reset)) = (ep.remaining, ep.reset_at) {
            until = until.max(reset);
        }
        secs_to_duration((until - now).min(self.max_block_secs()))
    }

    fn max_block_secs(&self) -> f64 {
        if self.cfg.max_block_secs.is_finite() && self.cfg.max_block_secs > 0.0 {
            self.cfg.max_block_secs
        } else {
            RateLimiterConfig::default().max_block_secs
        }
    }

    /// Read quota headers from a completed response and tighten the rate
    /// before the upstream starts answering 429.
    pub async fn parse_rate_limit_headers(&self, headers: &Headers, endpoint: Option<&str>) {
        let remaining = header_first(headers, self.cfg.remaining_headers.as_slice())
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v as u64);
        let limit = header_first(headers, self.cfg.limit_headers.as_slice())
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v > 0.0)
            .map(|v| v as u64);
        let reset = header_first(headers, self.cfg.reset_headers.as_slice()).and_then(|v| v.parse::<f64>().ok());

        if remaining.is_none() && limit.is_none() && reset.is_none() {
            return;
        }

        let key = endpoint_key(endpoint);
        let now = self.clock.unix_now();
        let latest = now + self.max_block_secs();
        let reset_at = reset.filter(|r| r.is_finite() && *r >= 0.0).map(|r| {
            let at = if r > EPOCH_THRESHOLD_SECS { r } else { now + r };
            at.min(latest)
        });

        let mut st = self.state.lock().await;
        let current_rate = st.current_rate;
        {
            let ep = st.endpoint(key, now, self.cfg.max_tracked_endpoints);
            if remaining.is_some() {
                ep.remaining = remaining;
            }
            if limit.is_some() {
                ep.limit = limit;
            }
            if reset_at.is_some() {
                ep.reset_at = reset_at;
            }
        }

        let Some(remaining) = remaining else {
            return;
        };

        if remaining == 0 {
            let until = reset_at.unwrap_or(now + self.cfg.default_cooldown_secs);
            st.endpoint(key, now, self.cfg.max_tracked_endpoints).blocked_until = Some(until);
            st.stats.proactive_throttles += 1;
            warn!(
                collector = %self.name,
                endpoint = key,
                blocked_for_secs = until - now,
                "upstream quota exhausted"
            );
            return;
        }

        let low = match limit {
            Some(limit) => (remaining as f64 / limit as f64) < self.cfg.low_quota_ratio,
            None => false,
        };
        if !low {
            return;
        }

        // Spread what is left over the time to reset, never speeding up.
        let target = match reset_at {
            Some(reset) if reset > now => remaining as f64 / (reset - now),
            _ => current_rate * self.cfg.decrease_factor,
        };
        let new_rate = target.min(current_rate).clamp(self.cfg.min_rate, self.cfg.max_rate);
        if new_rate < current_rate {
            st.current_rate = new_rate;
            st.success_streak = 0;
            st.stats.rate_decreases += 1;
            st.stats.proactive_throttles += 1;
            info!(
                collector = %self.name,
                endpoint = key,
                remaining,
                old_rate = current_rate,
                new_rate,
                "quota running low, rate tightened"
            );
        }
    }

    /// React to a 429: grow the backoff multiplier, cut the rate, and block the
    /// endpoint until `retry_after` (or a scaled default cooldown) has passed.
    pub async fn record_rate_limit_violation(&self, endpoint: Option<&str>, retry_after: Option<Duration>) {
        let key = endpoint_key(endpoint);
        let now = self.clock.unix_now();
        let mut st = self.state.lock().await;

        st.backoff_multiplier = (st.backoff_multiplier * self.cfg.backoff_factor).min(self.cfg.max_backoff);
        st.current_rate = (st.current_rate * self.cfg.decrease_factor).max(self.cfg.min_rate);
        st.success_streak = 0;
        st.stats.rate_limit_hits += 1;
        st.stats.rate_decreases += 1;

        let block_secs = match retry_after {
            Some(d) => d.as_secs_f64(),
            None => self.cfg.default_cooldown_secs * st.backoff_multiplier,
        }
        .min(self.max_block_secs());
        let backoff_multiplier = st.backoff_multiplier;
        let current_rate = st.current_rate;
        let ep = st.endpoint(key, now, self.cfg.max_tracked_endpoints);
        let until = now + block_secs;
        ep.blocked_until = Some(ep.blocked_until.map_or(until, |b| b.max(until)));
        ep.rate_limit_hits += 1;

        warn!(
            collector = %self.name,
            endpoint = key,
            retry_after_secs = block_secs,
            backoff_multiplier,
            current_rate,
            "rate limit violation"
        );
    }

    /// Alias of [`RateLimiter::record_rate_limit_violation`].
    pub async fn record_429(&self, endpoint: Option<&str>, retry_after: Option<Duration>) {
        self.record_rate_limit_violation(endpoint, retry_after).await;
    }

    /// Feed back one completed request.
    ///
    /// Slow responses and server errors shrink the rate in proportion to how far
    /// latency overshot `slow_latency_secs` (never by more than
    /// `decrease_factor`). Sustained fast successes close a fraction
    /// `increase_gain` of the gap to `max_rate`.
    pub async fn adjust_rate(&self, observed_latency: Duration, status: u16) {
        if status == 429 {
            return;
        }
        let latency = observed_latency.as_secs_f64();
        let mut st = self.state.lock().await;
        let old_rate = st.current_rate;

        if status >= 500 || latency > self.cfg.slow_latency_secs {
            let factor = if status >= 500 {
                self.cfg.decrease_factor
            } else {
                (self.cfg.slow_latency_secs / latency).max(self.cfg.decrease_factor)
            };
            st.current_rate = (old_rate * factor).max(self.cfg.min_rate);
            st.success_streak = 0;
            if st.current_rate < old_rate {
                st.stats.rate_decreases += 1;
                debug!(collector = %self.name, status, latency_ms = observed_latency.as_millis() as u64, old_rate, new_rate = st.current_rate, "rate decreased");
            }
            return;
        }

        if !(200..300).contains(&status) {
            return;
        }

        st.backoff_multiplier = (st.backoff_multiplier * self.cfg.backoff_decay).max(1.0);

        if latency <= self.cfg.fast_latency_secs {
            st.success_streak += 1;
            if st.success_streak >= self.cfg.increase_after_successes {
                st.success_streak = 0;
                let step = (self.cfg.max_rate - old_rate) * self.cfg.increase_gain;
                st.current_rate = (old_rate + step).min(self.cfg.max_rate);
                if st.current_rate > old_rate {
                    st.stats.rate_increases += 1;
                    debug!(collector = %self.name, old_rate, new_rate = st.current_rate, "rate increased");
                }
            }
        }
    }

    pub async fn current_rate(&self) -> f64 {
        self.state.lock().await.current_rate
    }

    pub async fn backoff_multiplier(&self) -> f64 {
        self.state.lock().await.backoff_multiplier
    }

    pub async fn status(&self) -> RateLimiterStatus {
        let st = self.state.lock().await;
        let now = self.clock.unix_now();
        let mut endpoints: Vec<EndpointStatus> = st
            .endpoints
            .iter()
            .map(|(k, ep)| EndpointStatus {
                endpoint: k.clone(),
                remaining: ep.remaining,
                limit: ep.limit,
                blocked_for_secs: ep.blocked_until.filter(|b| *b > now).map(|b| b - now),
                requests: ep.requests,
                rate_limit_hits: ep.rate_limit_hits,
            })
            .collect();
        endpoints.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        RateLimiterStatus {
            collector: self.name.clone(),
            current_rate: st.current_rate,
            effective_rate: st.effective_rate(&self.cfg),
            backoff_multiplier: st.backoff_multiplier,
            min_rate: self.cfg.min_rate,
            max_rate: self.cfg.max_rate,
            endpoints,
            stats: st.stats.clone(),
        }
    }

    pub async fn stats(&self) -> RateLimiterStats {
        self.state.lock().await.stats.clone()
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let st = self.state.lock().await;
        RateLimiterSnapshot {
            current_rate: st.current_rate,
            backoff_multiplier: st.backoff_multiplier,
            success_streak: st.success_streak,
            endpoints: st
                .endpoints
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            stats: st.stats.clone(),
        }
    }

    pub async fn restore(&self, snap: RateLimiterSnapshot) {
        let mut st = self.state.lock().await;
        st.current_rate = if snap.current_rate.is_finite() {
            snap.current_rate.clamp(self.cfg.min_rate, self.cfg.max_rate)
        } else {
            self.cfg.default_rate
        };
        st.backoff_multiplier = if snap.backoff_multiplier.is_finite() {
            snap.backoff_multiplier.clamp(1.0, self.cfg.max_backoff)
        } else {
            1.0
        };
        st.success_streak = snap.success_streak;
        st.endpoints.clear();
        let needed = snap.endpoints.len().max(self.cfg.max_tracked_endpoints).max(1);
        if let Some(cap) = NonZeroUsize::new(needed) {
            st.endpoints.resize(cap);
        }
        for (k, v) in snap.endpoints {
            st.endpoints.put(k, v);
        }
        st.stats = snap.stats;
    }

    /// Persist under `rate_limiter:{name}`.
    pub async fn save_state(&self, store: &StateStore) -> Result<()> {
        let snap = self.snapshot().await;
        store.save(&limiter_key(&self.name), &snap).await?;
        debug!(collector = %self.name, current_rate = snap.current_rate, "rate limiter state saved");
        Ok(())
    }

    pub async fn load_state(&self, store: &StateStore) -> Result<bool> {
        match store.load::<RateLimiterSnapshot>(&limiter_key(&self.name)).await? {
            Some(snap) => {
                info!(
                    collector = %self.name,
                    current_rate = snap.current_rate,
                    backoff_multiplier = snap.backoff_multiplier,
                    "rate limiter state restored"
                );
                self.restore(snap).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Parse `Retry-After` as delta seconds or as an HTTP-date relative to `now`.
///
/// A date in the past yields zero. Values too large for a `Duration`
/// saturate; the limiter caps every block at `max_block_secs`.
pub fn parse_retry_after(headers: &Headers, now: SystemTime) -> Option<Duration> {
    let raw = header_first(headers, &["retry-after"])?;
    if let Ok(secs) = raw.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX));
        }
        return None;
    }
    let at = httpdate::parse_http_date(&raw).ok()?;
    Some(at.duration_since(now).unwrap_or(Duration::ZERO))
}
