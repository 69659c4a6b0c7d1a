//! RetryPolicy — exponential backoff and error-kind matching for node retries.

use std::time::Duration;

use rand::Rng;

use crate::config::ResolvedConfig;
use crate::error::{ErrorKind, GraphError};

/// Decision returned by [`RetryPolicy::decide`] after a node attempt fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry(Duration),
    /// Exhausted, excluded by `no_retry_errors`, or not in `retry_on_errors`.
    GiveUp,
}

pub struct RetryPolicy;

impl RetryPolicy {
    /// `attempt` is the attempt number that just failed (1-based).
    pub fn decide(config: &ResolvedConfig, attempt: u32, error: &GraphError) -> RetryDecision {
        if attempt >= config.max_attempts {
            return RetryDecision::GiveUp;
        }
        if !Self::is_retryable(config, error.kind()) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(Self::backoff_delay(config, attempt))
    }

    /// `no_retry_errors` takes precedence over `retry_on_errors`. An empty
    /// `retry_on_errors` means "retry anything not explicitly excluded".
    fn is_retryable(config: &ResolvedConfig, kind: ErrorKind) -> bool {
        let name = kind.to_string();
        if config.no_retry_errors.iter().any(|k| *k == name) {
            return false;
        }
        if config.retry_on_errors.is_empty() {
            return true;
        }
        config.retry_on_errors.iter().any(|k| *k == name)
    }

    /// `baseDelay * backoffMultiplier^(attempt-1)`, capped at 60s, with up to 20%
    /// jitter to avoid thundering-herd retries across a fan-out.
    fn backoff_delay(config: &ResolvedConfig, attempt: u32) -> Duration {
        const BASE_DELAY_MS: u64 = 500;
        const CAP_MS: u64 = 60_000;

        let exponent = attempt.saturating_sub(1);
        let multiplier = (config.backoff_multiplier as u64).saturating_pow(exponent);
        let raw_ms = BASE_DELAY_MS.saturating_mul(multiplier).min(CAP_MS);

        let jitter_ms = rand::thread_rng().gen_range(0..=(raw_ms / 5).max(1));
        Duration::from_millis(raw_ms + jitter_ms)
    }
}
