use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::Result;

/// Fixed-count, fixed-delay retry around a unit of work. Only retryable
/// errors are repeated; anything else returns on first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        RetryPolicy { attempts, delay }
    }

    /// Run `unit` until it succeeds, fails permanently, or attempts run out.
    /// A cancelled token cuts the inter-attempt wait short and returns the
    /// last error.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut unit: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match unit().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= attempts {
                error!(unit = label, attempts, "Max retries reached: {}", err);
                return Err(err);
            }
            warn!(
                "Error in {}: {}. Retry {}/{} in {:.1}s",
                label,
                err,
                attempt,
                attempts,
                self.delay.as_secs_f64()
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(err),
                _ = tokio::time::sleep(self.delay) => {}
            }
            attempt += 1;
        }
    }
}
