//! Bounded exponential backoff for transient broker errors.
//!
//! The retry position is an explicit [`RetryState`] value rather than a hidden
//! loop counter, so callers can thread it through their own result types and
//! tests can step through it without sleeping.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 200,
            max_delay_ms: 5000,
            multiplier: 2,
        }
    }
}

/// Where a retried operation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// 1-based number of the attempt about to run.
    pub attempt: u32,
    /// Delay to wait if this attempt fails transiently.
    pub next_delay: Duration,
}

impl RetryPolicy {
    pub fn start(&self) -> RetryState {
        RetryState {
            attempt: 1,
            next_delay: Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms)),
        }
    }

    /// State for the next attempt, or `None` once attempts are exhausted.
    pub fn advance(&self, state: RetryState) -> Option<RetryState> {
        if state.attempt >= self.max_attempts {
            return None;
        }
        let grown = state.next_delay.as_millis() as u64 * u64::from(self.multiplier.max(1));
        Some(RetryState {
            attempt: state.attempt + 1,
            next_delay: Duration::from_millis(grown.min(self.max_delay_ms)),
        })
    }
}

/// Runs `operation` until it succeeds, fails non-transiently or runs out of
/// attempts. Returns the final result together with the number of attempts made.
pub async fn retry_transient<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> (Result<T, BrokerError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut state = policy.start();
    loop {
        match operation().await {
            Ok(value) => {
                if state.attempt > 1 {
                    debug!(operation = operation_name, attempt = state.attempt, "Succeeded after retry");
                }
                return (Ok(value), state.attempt);
            }
            Err(err) if err.is_transient() => match policy.advance(state) {
                Some(next) => {
                    warn!(
                        operation = operation_name,
                        attempt = state.attempt,
                        backoff_ms = state.next_delay.as_millis() as u64,
                        error = %err,
                        "Broker unavailable, will retry after backoff"
                    );
                    tokio::time::sleep(state.next_delay).await;
                    state = next;
                }
                None => {
                    warn!(operation = operation_name, attempts = state.attempt, error = %err, "Giving up after retries");
                    return (Err(err), state.attempt);
                }
            },
            Err(err) => return (Err(err), state.attempt),
        }
    }
}
