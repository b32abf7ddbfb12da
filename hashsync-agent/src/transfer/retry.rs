//! Bounded remote operations.
//!
//! Every remote call goes through [`RetryPolicy::run`]: each attempt gets a
//! fresh timeout, retryable failures are repeated up to the configured count,
//! and anything else is returned immediately.

use crate::config::SyncTarget;
use crate::utils::errors::{Result, SyncError};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first
    pub retries: u32,
    pub timeout: Duration,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, timeout: Duration, delay: Duration) -> Self {
        Self { retries, timeout, delay }
    }

    pub fn from_target(target: &SyncTarget) -> Self {
        Self::new(target.retry, target.timeout(), target.retry_delay())
    }

    /// Run `op` under a timeout, retrying transient failures.
    ///
    /// `what` names the operation in logs and timeout errors, typically
    /// `bucket/key`.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match with_timeout(self.timeout, what, op()).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= attempts {
                if attempt > 1 {
                    warn!("{} failed after {} attempts: {}", what, attempt, err);
                }
                return Err(err);
            }

            debug!("{} attempt {}/{} failed: {}", what, attempt, attempts, err);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay * attempt).await;
            }
        }
    }
}

/// Bound a single attempt. Expiry drops (cancels) the future.
pub async fn with_timeout<T, Fut>(timeout: Duration, what: &str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout {
            operation: what.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
