//! Retry with exponential backoff, kept separate from the transfer itself.

use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::error::ClientError;

/// Retry settings for part transfers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    /// Run `op` until it succeeds, fails permanently, exhausts the retry
    /// budget or `cancel` fires. Only transient errors are retried.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> Result<T, ClientError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        self.run_if(cancel, ClientError::is_transient, op).await
    }

    /// Like [`run`](Self::run), retrying only errors for which `retryable`
    /// holds.
    pub async fn run_if<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        retryable: impl Fn(&ClientError) -> bool,
        mut op: F,
    ) -> Result<T, ClientError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                result = op(attempt) => result,
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if retryable(&err) && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff_for(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying after transient failure");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}
