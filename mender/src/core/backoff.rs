//! Exponential backoff with a cap and symmetric jitter.

use std::time::Duration;

use rand::Rng;

/// Delay policy for retrying a failing operation.
///
/// `delay_for_attempt` computes `base_delay * 2^attempt`, capped at
/// `max_delay`, then applies uniform jitter of `± jitter_fraction` of the
/// capped value. Randomizing the delay keeps independent callers from
/// retrying in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry (attempt 0).
    pub base_delay: Duration,
    /// Upper bound on the un-jittered delay.
    pub max_delay: Duration,
    /// Symmetric jitter range as a fraction of the capped delay (0.5 = ±50%).
    pub jitter_fraction: f64,
    /// Maximum number of attempts the retry wrapper may make. Must be >= 1.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter_fraction: 0.5,
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// Compute the jittered delay for a 0-indexed retry attempt.
    ///
    /// Deterministic given a fixed `rng`. The result is clamped to be
    /// non-negative and never exceeds `max_delay * (1 + jitter_fraction)`.
    pub fn delay_for_attempt<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        // Cap the exponent; 31 doublings already dwarf any practical max_delay.
        let exp = attempt.min(31) as i32;
        let base_secs = self.base_delay.as_secs_f64() * 2f64.powi(exp);
        let capped = base_secs.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter_fraction > 0.0 {
            let range = capped * self.jitter_fraction;
            capped + rng.gen_range(-range..=range)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }
}
