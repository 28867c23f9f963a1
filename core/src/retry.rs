//! Retry wrapper (spec §4.1, component C1).
//!
//! Grounded on `llm/client.rs::retry_with_backoff` in the teacher crate:
//! jittered exponential backoff, cooperative cancellation via a
//! `tokio_util::sync::CancellationToken`, and a status callback invoked
//! before each sleep.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::EmaError;

/// Retry policy (spec §6 `llm.retry`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            exponential_base: 2.0,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay_ms as f64 * self.exponential_base.powi(attempt as i32);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Runs `f` under `policy`, honoring `cancel`. `on_retry` is called before
/// each sleep with `(attempt, error, delay)`; it must not panic and its
/// return value is ignored.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut f: F,
    mut on_retry: impl FnMut(u32, &E, Duration),
) -> Result<T, EmaError>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    if !policy.enabled {
        return tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EmaError::cancelled("retry wrapper: cancelled before first attempt")),
            res = f() => res.map_err(|e| EmaError::RetryExhausted { attempts: 1, last_error: e.to_string() }),
        };
    }

    let mut attempt = 0u32;
    let mut last_error = String::new();

    loop {
        if cancel.is_cancelled() {
            return Err(EmaError::cancelled("retry wrapper: cancelled before attempt"));
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(EmaError::cancelled("retry wrapper: cancelled during attempt"));
            }
            res = f() => res,
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_error = err.to_string();
                attempt += 1;
                if attempt >= policy.max_retries {
                    return Err(EmaError::RetryExhausted { attempts: attempt, last_error });
                }

                let delay = policy.delay_for(attempt - 1);
                let jitter_ms: i64 = rand::thread_rng().gen_range(-50..=50);
                let jittered = Duration::from_millis(
                    (delay.as_millis() as i64 + jitter_ms).max(0) as u64,
                );

                on_retry(attempt, &err, jittered);
                warn!(attempt, delay_ms = jittered.as_millis() as u64, %last_error, "retrying after failure");

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(EmaError::cancelled("retry wrapper: cancelled during backoff sleep"));
                    }
                    _ = tokio::time::sleep(jittered) => {}
                }
            }
        }
    }
}
