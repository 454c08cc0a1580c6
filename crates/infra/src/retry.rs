//! Bounded retry for lock contention.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::EngineResult;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    /// base * 2^(attempt - 1), capped at `max_delay`.
    #[default]
    Exponential,
}

/// How often, and how patiently, a unit of work is retried after losing a
/// lock race. Only `LockTimeout`/`Contention` are ever retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = fail on the first timeout).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }

    pub fn should_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. Each attempt must start a fresh unit of work.
    pub fn run<T>(
        &self,
        operation: &'static str,
        mut op: impl FnMut() -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut retries = 0;
        loop {
            match op() {
                Err(err) if err.is_retryable() => {
                    if !self.should_retry(retries) {
                        error!(
                            operation,
                            attempts = retries + 1,
                            error = %err,
                            "lock contention retries exhausted"
                        );
                        return Err(err);
                    }
                    retries += 1;
                    let delay = self.delay_for_attempt(retries);
                    warn!(
                        operation,
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "lock contention, retrying"
                    );
                    std::thread::sleep(delay);
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    #[test]
    fn exponential_delays_double_and_cap() {
        let p = RetryPolicy::exponential(5, Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(p.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(40));
        assert_eq!(p.delay_for_attempt(4), Duration::from_millis(50));
        assert_eq!(p.delay_for_attempt(40), Duration::from_millis(50));
    }

    #[test]
    fn retries_contention_then_succeeds() {
        let p = RetryPolicy::fixed(3, Duration::ZERO);
        let mut calls = 0;
        let out = p.run("test", || {
            calls += 1;
            if calls < 3 {
                Err(EngineError::LockTimeout("row".into()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(out.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_the_budget() {
        let p = RetryPolicy::fixed(2, Duration::ZERO);
        let mut calls = 0;
        let out: EngineResult<()> = p.run("test", || {
            calls += 1;
            Err(EngineError::Contention("row".into()))
        });
        assert!(matches!(out, Err(EngineError::Contention(_))));
        assert_eq!(calls, 3);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let p = RetryPolicy::fixed(5, Duration::ZERO);
        let mut calls = 0;
        let out: EngineResult<()> = p.run("test", || {
            calls += 1;
            Err(EngineError::Validation("bad".into()))
        });
        assert!(out.is_err());
        assert_eq!(calls, 1);
    }
}
