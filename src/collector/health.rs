use crate::client::RequestStats;
use crate::resilience::{CircuitBreakerStatus, CircuitState, RateLimiterStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Failed,
    CircuitOpen,
}

impl HealthState {
    /// Precedence: CircuitOpen, then Failed (failures > 2x successes), then
    /// Degraded (any failure), then Healthy.
    pub fn classify(breaker: CircuitState, successes: u64, failures: u64) -> Self {
        if breaker == CircuitState::Open {
            HealthState::CircuitOpen
        } else if failures > successes.saturating_mul(2) {
            HealthState::Failed
        } else if failures > 0 {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthState::Healthy | HealthState::Degraded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Failed => "failed",
            HealthState::CircuitOpen => "circuit_open",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-cycle counters, published as an immutable snapshot after every cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleStats {
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub data_points_collected: u64,
    pub last_success_time: Option<f64>,
    pub last_error_time: Option<f64>,
    pub last_error: Option<String>,
    pub last_cycle_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub collector: String,
    pub healthy: bool,
    pub status: HealthState,
    pub is_running: bool,
    pub circuit_breaker: CircuitBreakerStatus,
    pub rate_limiter: RateLimiterStatus,
    pub requests: RequestStats,
    pub cycles: CycleStats,
    pub timestamp: f64,
}
