//! Retry with exponential backoff
//!
//! Delay after the k-th failed attempt is `base * 2^(k-1)`: 100ms, 200ms,
//! 400ms with the default base. No jitter, no cap, and no sleep after the
//! final attempt.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::StoreError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Largest exponent applied to the base delay
const MAX_SHIFT: u32 = 20;

#[derive(Debug)]
pub struct BackoffExecutor {
    max_attempts: u32,
    base_delay: Duration,
    /// Attempts beyond the first, across every run
    retries: AtomicU64,
}

impl Default for BackoffExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY)
    }
}

impl BackoffExecutor {
    /// `max_attempts` is clamped to at least one
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            retries: AtomicU64::new(0),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Sleep before the next attempt after `failed` failures (1-based)
    pub fn delay_after(&self, failed: u32) -> Duration {
        let shift = failed.saturating_sub(1).min(MAX_SHIFT);
        self.base_delay.saturating_mul(1 << shift)
    }

    /// Run `op` with the configured attempt budget
    pub async fn run<T, E, F, Fut>(&self, label: &str, op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.run_with(self.max_attempts, label, op).await
    }

    /// Run `op` up to `max_attempts` times.
    ///
    /// Returns the first success, or `ExhaustedRetries` carrying the last error.
    pub async fn run_with<T, E, F, Fut>(
        &self,
        max_attempts: u32,
        label: &str,
        mut op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max_attempts => {
                    tracing::error!(
                        operation = label,
                        attempts = attempt,
                        "Storage operation failed: {}",
                        e
                    );
                    return Err(StoreError::ExhaustedRetries {
                        operation: label.to_string(),
                        attempts: attempt,
                        last_error: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        operation = label,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Storage operation failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    attempt += 1;
                }
            }
        }
    }
}
