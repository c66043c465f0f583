//! Retry policy for inbound handlers.
//!
//! Bounded attempts on a `backon` exponential schedule, plus a configured
//! random jitter. Only transient failures are retried; every sleep is cut
//! short by cancellation.

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::ConsumerConfig;

use super::handlers::HandlerError;

/// Upper bound for a single backoff step
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Why a retried operation gave up
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    #[error(transparent)]
    Permanent(HandlerError),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: HandlerError },

    #[error("Cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_jitter,
        }
    }

    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self::new(config.max_attempts, config.backoff_base, config.max_jitter)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Deterministic delays between attempts, one fewer than `max_attempts`
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(MAX_BACKOFF.max(self.base_delay))
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .build()
    }

    fn jitter(&self) -> Duration {
        let max = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    /// Run `operation` until it succeeds, fails permanently, runs out of
    /// attempts or `cancel` fires. The closure receives the attempt number.
    ///
    /// On cancellation the in-flight attempt is dropped, which rolls back any
    /// transaction it holds.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, HandlerError>>,
    {
        let mut delays = self.backoff();
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                result = operation(attempt) => result,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(RetryError::Permanent(e)),
                Err(e) => e,
            };

            let Some(backoff) = delays.next() else {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            };

            let delay = backoff + self.jitter();
            tracing::warn!(
                attempt = attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ConsumerConfig::default())
    }
}
