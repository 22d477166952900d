use std::{future::Future, time::Duration};

use client_transport::RawFailure;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    diagnostics::ErrorLog,
    error::{ClientError, ErrorRecord},
};

/// Exponential backoff policy used by retry loops.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base_delay_ms: u64,
    multiplier: u32,
    max_retries: u32,
}

impl BackoffPolicy {
    pub fn new(base_delay_ms: u64, multiplier: u32, max_retries: u32) -> Self {
        Self {
            base_delay_ms,
            multiplier: multiplier.max(1),
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the retry following `attempt` (zero-indexed):
    /// `base · multiplier^attempt`, saturating on overflow.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = (self.multiplier as u64)
            .checked_pow(attempt)
            .unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(500, 2, 3)
    }
}

/// Run `op` with classified retry-with-backoff.
///
/// Total attempts are `max_retries + 1`. Every failure is classified
/// and recorded in `errors`; a terminal classification or exhaustion
/// propagates the final error unchanged. Backoff sleeps are cut short
/// by `cancel`, in which case a `cancelled` error is returned before
/// any further attempt fires.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: BackoffPolicy,
    errors: &ErrorLog,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RawFailure>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(failure) => {
                let record = errors.classify_and_record(&failure);
                if !record.retryable || attempt >= policy.max_retries {
                    return Err(ClientError::from_record(&record));
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    classification = record.classification.label(),
                    "retrying after backoff"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(cancelled_error(&record)),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// Run `op` with a caller-supplied retry predicate and linear delay.
///
/// The delay before the retry following `attempt` grows as
/// `delay · (attempt + 1)`. Total attempts are `max_retries + 1`.
pub async fn retry_with_condition<T, E, F, Fut, P>(
    mut op: F,
    mut predicate: P,
    max_retries: u32,
    delay: Duration,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E, u32) -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_retries || !predicate(&err, attempt) {
                    return Err(err);
                }
                tokio::time::sleep(delay * (attempt + 1)).await;
                attempt += 1;
            }
        }
    }
}

fn cancelled_error(last: &ErrorRecord) -> ClientError {
    let mut err = ClientError::cancelled("retry backoff");
    err.message = format!("{} (last failure: {})", err.message, last.message);
    err
}
