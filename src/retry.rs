//! Retry With Exponential Backoff
//!
//! Bounded retry applied around every processor invocation. Each failed attempt waits
//! `initial_delay`, doubling per attempt up to `max_delay`, until `max_attempts` have run.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Default number of attempts per (transaction, processor) pair
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay after the first failure
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1000;

/// Default upper bound for any single delay
pub const DEFAULT_MAX_DELAY_MS: u64 = 5000;

/// Retry policy as configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(alias = "maxAttempts")]
    pub max_attempts: u32,
    #[serde(alias = "initialDelay")]
    pub initial_delay_ms: u64,
    #[serde(alias = "maxDelay")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(20);
        let delay_ms = self.initial_delay_ms.saturating_mul(1u64 << doublings);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }

    /// Reject policies that could never succeed or never back off sensibly
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(format!(
                "initial_delay_ms ({}) exceeds max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            ));
        }
        Ok(())
    }
}

/// Run `operation` under `policy`, returning the first success or the last error
///
/// # Arguments
/// * `policy` - Attempt and delay bounds
/// * `label` - Name used in retry log lines
/// * `operation` - Produces a fresh future per attempt
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    operation = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
