//! Generic execute-with-retries combinator over the backoff policy.

use std::thread;

use anyhow::{Result, anyhow};
use tracing::{debug, info, warn};

use crate::core::backoff::BackoffPolicy;
use crate::error::OrchestratorError;

/// Run `op` up to `policy.max_retries` times, sleeping a jittered backoff
/// delay between attempts (never after the last).
///
/// Returns the first success, or the final attempt's error unchanged. An
/// error that classifies as non-retryable (see
/// [`OrchestratorError::is_retryable`]) escalates immediately: launching
/// the child at all failed, so running it again cannot help.
pub fn with_retries<T, F>(policy: &BackoffPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut last_err = None;
    for attempt in 0..policy.max_retries {
        match op() {
            Ok(value) => {
                if attempt > 0 {
                    info!(label, attempt = attempt + 1, "succeeded after retries");
                }
                return Ok(value);
            }
            Err(err) => {
                if let Some(classified) = err.downcast_ref::<OrchestratorError>()
                    && !classified.is_retryable()
                {
                    warn!(label, err = %classified, "non-retryable failure, giving up");
                    return Err(err);
                }
                warn!(
                    label,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    err = %err,
                    "attempt failed"
                );
                if attempt + 1 < policy.max_retries {
                    let delay = policy.delay_for_attempt(attempt, &mut rand::thread_rng());
                    debug!(
                        label,
                        delay_ms = delay.as_millis() as u64,
                        "sleeping before retry"
                    );
                    thread::sleep(delay);
                }
                last_err = Some(err);
            }
        }
    }
    warn!(label, max_retries = policy.max_retries, "all attempts failed");
    Err(last_err.unwrap_or_else(|| anyhow!("retry wrapper invoked with zero attempts")))
}
