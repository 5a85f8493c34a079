//! Attempt loop with exponential backoff + jitter, retry-on-exception and
//! retry-on-status-code predicates. Grounded on
//! `app/services/resilience.py::call_with_retries` /
//! `call_blocking_with_timeout`.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::timeout;

use crate::error::{PipelineError, Result};

/// Backoff schedule for a retry loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_s: f64,
    pub max_delay_s: f64,
    pub jitter_s: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_s: 0.2,
            max_delay_s: 1.0,
            jitter_s: 0.2,
        }
    }
}

/// HTTP status codes the source treats as transient.
pub const TRANSIENT_HTTP_STATUS: &[u16] = &[408, 425, 429, 500, 502, 503, 504];

fn compute_backoff(attempt: u32, policy: &RetryPolicy) -> Duration {
    let delay = policy
        .max_delay_s
        .min(policy.base_delay_s * 2f64.powi(attempt as i32 - 1));
    let jitter = if policy.jitter_s > 0.0 {
        rand::rng().random_range(0.0..policy.jitter_s)
    } else {
        0.0
    };
    Duration::from_secs_f64((delay + jitter).max(0.0))
}

/// Outcome of a single call attempt, as seen by the retry executor.
pub enum Attempt<T> {
    /// Succeeded with a result that should be returned as-is.
    Done(T),
    /// Succeeded but the caller says the status warrants a retry.
    RetryableStatus(T),
}

/// Runs `call` up to `policy.max_attempts` times. `call` reports whether its
/// success value should be retried via [`Attempt::RetryableStatus`]; a
/// transport-level error is retried unless attempts are exhausted, at which
/// point the last error is surfaced.
pub async fn call_with_retries<T, E, F, Fut>(mut call: F, policy: &RetryPolicy) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<Attempt<T>, E>>,
    E: std::fmt::Display,
{
    let mut last_err: Option<String> = None;
    for attempt in 1..=policy.max_attempts.max(1) {
        match call(attempt).await {
            Ok(Attempt::Done(value)) => return Ok(value),
            Ok(Attempt::RetryableStatus(value)) => {
                if attempt >= policy.max_attempts {
                    return Ok(value);
                }
                tokio::time::sleep(compute_backoff(attempt, policy)).await;
            }
            Err(e) => {
                last_err = Some(e.to_string());
                if attempt >= policy.max_attempts {
                    break;
                }
                tokio::time::sleep(compute_backoff(attempt, policy)).await;
            }
        }
    }
    Err(PipelineError::Transport(
        last_err.unwrap_or_else(|| "retry execution failed".to_string()),
    ))
}

/// Returns true if `status` is one of the transient statuses worth retrying.
#[must_use]
pub fn is_transient_status(status: u16, extra: &HashSet<u16>) -> bool {
    TRANSIENT_HTTP_STATUS.contains(&status) || extra.contains(&status)
}

/// Runs a blocking closure on a worker thread, failing with
/// [`PipelineError::Timeout`] if it exceeds `timeout_s`.
pub async fn call_blocking_with_timeout<T, F>(f: F, timeout_s: f64) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let duration = Duration::from_secs_f64(timeout_s.max(0.0));
    match timeout(duration, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join_err)) => Err(PipelineError::Transport(format!(
            "blocking task panicked: {join_err}"
        ))),
        Err(_) => Err(PipelineError::Timeout(duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_done() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_s: 0.001,
            max_delay_s: 0.002,
            jitter_s: 0.0,
        };
        let result: Result<u32> = call_with_retries(
            |attempt| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err::<Attempt<u32>, String>("transient".to_string())
                    } else {
                        Ok(Attempt::Done(42))
                    }
                }
            },
            &policy,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_and_surfaces_last_error() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay_s: 0.001,
            max_delay_s: 0.002,
            jitter_s: 0.0,
        };
        let result: Result<u32> = call_with_retries(
            |_attempt| async move { Err::<Attempt<u32>, String>("boom".to_string()) },
            &policy,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn blocking_call_times_out() {
        let result = call_blocking_with_timeout(
            || {
                std::thread::sleep(Duration::from_millis(200));
                1u32
            },
            0.01,
        )
        .await;
        assert!(matches!(result, Err(PipelineError::Timeout(_))));
    }
}
