//! Bounded exponential-backoff retry for Census calls.
//!
//! Only transient failures ([`CensusError::is_transient`]) are retried. An
//! empty result is a normal answer and is returned as-is. With the defaults a
//! call is attempted once and then retried up to six times, sleeping 2, 4, 8,
//! 16, 32 and 64 seconds in between.

use crate::census::CensusError;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 6;

/// Delay unit; retry `n` waits `base * 2^n`
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on the backoff exponent
const MAX_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `retry` (1-based). Saturates at `Duration::MAX`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .checked_mul(1u32 << retry.min(MAX_EXPONENT))
            .unwrap_or(Duration::MAX)
    }

    /// Run `operation`, retrying transient failures.
    ///
    /// `what` names the call in log output. The final error is returned once
    /// retries are exhausted.
    pub async fn execute<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, CensusError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CensusError>>,
    {
        let mut retry = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry < self.max_retries => {
                    retry += 1;
                    let delay = self.delay_for(retry);

                    error!(error = %e, operation = %what, "Census request failed");
                    warn!(
                        operation = %what,
                        retry = retry,
                        max_retries = self.max_retries,
                        delay_secs = delay.as_secs_f64(),
                        "Failed to {}, will retry in {:?}",
                        what,
                        delay
                    );

                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        error!(
                            error = %e,
                            operation = %what,
                            retries = retry,
                            "Retries exhausted"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BASE_DELAY)
    }
}
