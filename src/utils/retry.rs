/// Bounded exponential backoff for retryable exchange failures
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::{CandleError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        RetryPolicy {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Never retry
    pub fn none() -> Self {
        RetryPolicy {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails terminally, or the budget is spent.
    /// Returns the value together with the number of retries consumed.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<(T, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => return Ok((value, retries)),
                Err(e) if e.is_retryable() => {
                    if retries >= self.max_retries {
                        error!(
                            "{} failed after {} attempts: {} ({})",
                            what,
                            retries + 1,
                            e,
                            e.error_code()
                        );
                        return Err(CandleError::RetriesExhausted {
                            attempts: retries + 1,
                            last: Box::new(e),
                        });
                    }
                    retries += 1;
                    let delay = self.delay_for(retries);
                    if e.is_rate_limited() {
                        warn!(
                            "🚦 {} rate limited, retry {}/{} in {:?}",
                            what, retries, self.max_retries, delay
                        );
                    } else {
                        warn!(
                            "{} failed ({}), retry {}/{} in {:?}",
                            what,
                            e.error_code(),
                            retries,
                            self.max_retries,
                            delay
                        );
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
