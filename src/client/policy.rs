use crate::config::RetryConfig;
use std::time::Duration;

/// Decision taken after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Retry { delay: Duration },
    Fail,
}

/// Retry budget and exponential backoff for one logical call.
///
/// Every failed attempt is retried until the budget is spent; the outcome
/// classification (429 vs. other failures) happens in the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_retries.max(1),
            base_delay: secs(cfg.retry_delay_secs),
            max_delay: secs(cfg.max_delay_secs),
        }
    }

    /// `base_delay * 2^attempt`, capped at `max_delay`. `attempt` is 0-based.
    pub fn backoff_delay(&self, base_delay: Duration, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub(crate) fn decide(&self, attempt: u32, max_attempts: u32, base_delay: Duration) -> Decision {
        if attempt + 1 < max_attempts {
            Decision::Retry {
                delay: self.backoff_delay(base_delay, attempt),
            }
        } else {
            Decision::Fail
        }
    }
}

fn secs(v: f64) -> Duration {
    if v.is_finite() && v > 0.0 {
        Duration::try_from_secs_f64(v).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}
