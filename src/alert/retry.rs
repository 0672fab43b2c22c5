//! Retry as a pure policy value consumed by one combinator. Transports know
//! nothing about retrying; the policy travels with the call site.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 1.5,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The caller's cancellation signal fired. No further attempts are made.
    #[error("context cancelled")]
    Cancelled,
    #[error("retries exhausted")]
    Exhausted(#[source] E),
}

/// Runs `op` until it succeeds, the policy is exhausted, or `cancel` flips
/// to true. Each attempt is exactly one call; the delay between attempts
/// grows by the backoff multiplier.
pub async fn with_retry<T, E, Fut, F>(
    policy: &RetryPolicy,
    cancel: &watch::Receiver<bool>,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut cancel = cancel.clone();
    let mut delay = policy.initial_delay;
    let mut last_err: Option<E> = None;

    for attempt in 0..=policy.max_retries {
        if *cancel.borrow() {
            return Err(RetryError::Cancelled);
        }
        if attempt > 0 {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return Err(RetryError::Cancelled);
                    }
                }
            }
            delay = Duration::from_secs_f64(delay.as_secs_f64() * policy.backoff_multiplier);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => last_err = Some(e),
        }
    }

    Err(RetryError::Exhausted(last_err.expect("at least one attempt ran")))
}
