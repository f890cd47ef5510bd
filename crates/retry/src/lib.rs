//! Exponential-backoff wrapper for calls to external, possibly-flaky
//! services. The first attempt runs immediately; attempt `k` (k >= 2) waits
//! `min(initial * multiplier^(k-2), max_delay)` beforehand.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

#[derive(Debug, Error)]
pub enum RetryError<E: Display> {
    /// Every attempt failed with a retryable error. Carries the attempt
    /// count and the last underlying error; never swallowed silently.
    #[error("Retries exhausted after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: E },
    /// The predicate rejected the error, so remaining attempts were not
    /// consumed.
    #[error("Aborted on non-retryable error: {source}")]
    Aborted { source: E },
}

impl<E: Display> RetryError<E> {
    pub fn into_source(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Aborted { source } => source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(2_000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(32_000),
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    /// Delay observed before the given 1-based attempt. The first attempt is
    /// never delayed.
    pub fn delay_before(&self, attempt: u32) -> Option<Duration> {
        if attempt < 2 {
            return None;
        }
        let exp = (attempt - 2) as i32;
        let ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = ms.min(self.max_delay.as_millis() as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// Run `f` until it succeeds, retrying every error.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, f: F) -> Result<T, RetryError<E>>
    where
        E: Display,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_if(operation, |_| true, f).await
    }

    /// Run `f` until it succeeds, retrying only errors accepted by
    /// `retryable`.
    pub async fn run_if<T, E, F, Fut, P>(
        &self,
        operation: &str,
        retryable: P,
        f: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Display,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            if let Some(delay) = self.delay_before(attempt) {
                sleep(delay).await;
            }
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if !retryable(&err) => {
                    warn!(operation, attempt, error = %err, "non-retryable error, aborting");
                    return Err(RetryError::Aborted { source: err });
                }
                Err(err) if attempt >= self.max_attempts => {
                    warn!(
                        operation,
                        attempts = attempt,
                        error = %err,
                        "retries exhausted"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    let next_delay = self
                        .delay_before(attempt + 1)
                        .unwrap_or_default()
                        .as_millis();
                    warn!(
                        operation,
                        attempt,
                        error = %err,
                        next_delay_ms = next_delay as u64,
                        "attempt failed, retrying"
                    );
                    attempt += 1;
                }
            }
        }
    }
}
