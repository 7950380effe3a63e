//! Retry policy shared by every stage.

use std::time::Duration;

use rand::Rng;

use crate::models::RetryConfig;

/// Exponential backoff with jitter and a bounded attempt count.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

/// What to do after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    /// Attempt budget spent; escalate to terminal
    Exhausted,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter,
        }
    }

    /// Retry without waiting.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Decide after `attempt` (1-based) failed with a retryable error.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::RetryAfter(self.delay(attempt))
        }
    }

    /// Delay before attempt `attempt + 1`.
    ///
    /// With jitter the delay is drawn from `[base / 2, base]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let base_ms = (self.initial_backoff.as_millis() as f64) * self.multiplier.powi(exponent);
        let base_ms = base_ms.min(self.max_backoff.as_millis() as f64) as u64;

        if !self.jitter || base_ms == 0 {
            return Duration::from_millis(base_ms);
        }
        let half = base_ms / 2;
        Duration::from_millis(half + rand::thread_rng().gen_range(0..=base_ms - half))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
