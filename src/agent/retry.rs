//! Retry policy for LLM calls.

use std::time::Duration;

use super::config::AgentConfig;
use crate::error::LlmError;

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max: Duration,
}

impl Backoff {
    /// Delay to wait after the given failed attempt (0-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

/// Attempt ceilings per error kind plus the backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed while failures are transient.
    pub max_transient_attempts: u32,
    /// Total attempts allowed while responses are malformed.
    pub max_malformed_attempts: u32,
    /// Delay schedule between attempts.
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Builds the policy from configuration.
    #[must_use]
    pub const fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_transient_attempts: config.max_retries,
            max_malformed_attempts: config.max_malformed_retries,
            backoff: Backoff {
                base: config.retry_base_delay,
                multiplier: 2.0,
                max: config.retry_max_delay,
            },
        }
    }

    /// Attempt ceiling for an error, or `None` if it must not be retried.
    #[must_use]
    pub const fn ceiling(&self, error: &LlmError) -> Option<u32> {
        match error {
            LlmError::Transient { .. } => Some(self.max_transient_attempts),
            LlmError::Malformed { .. } => Some(self.max_malformed_attempts),
            LlmError::ContextLimitExceeded { .. } | LlmError::Fatal { .. } | LlmError::Cancelled => {
                None
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_transient_attempts: 5,
            max_malformed_attempts: 2,
            backoff: Backoff::default(),
        }
    }
}
