//! Retry decisions with exponential backoff
//!
//! Only transient failures (transport errors and 5xx responses) are counted
//! against the retry budget. Quota rejections are waited out through the
//! [`QuotaGate`](crate::state::QuotaGate) and re-issued without consuming an
//! attempt.

use crate::config::RetryConfig;
use std::time::Duration;

/// Outcome of consulting the retry policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp { reason: String },
}

/// Bounded retry budget for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_retries, config.base_backoff(), config.max_backoff())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_backoff,
            max_backoff: max_backoff.max(base_backoff),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decides what to do after a transient failure
    ///
    /// `transient_failures` is the number of transient failures seen so far
    /// for this call, including the one just observed.
    pub fn should_retry(&self, transient_failures: u32) -> RetryDecision {
        if transient_failures >= self.max_retries {
            tracing::debug!(
                attempts = transient_failures,
                max = self.max_retries,
                "retry budget exhausted"
            );
            return RetryDecision::GiveUp {
                reason: format!("max retries ({}) exhausted", self.max_retries),
            };
        }
        RetryDecision::Retry {
            delay: self.backoff(transient_failures),
        }
    }

    /// `min(base * 2^attempt, max)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .map(|d| d.min(self.max_backoff))
            .unwrap_or(self.max_backoff)
    }
}
