//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a cap and proportional jitter.
///
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay)
///       + uniform(0, jitter * delay)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier per additional attempt.
    pub multiplier: f64,

    /// Upper bound on the computed delay (before jitter).
    pub max_delay: Duration,

    /// Jitter fraction of the computed delay, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy without jitter, for deterministic scheduling.
    pub fn fixed(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            jitter: 0.0,
        }
    }

    /// Delay before the next retry, given the attempt that just failed
    /// (1-indexed).
    ///
    /// With base=1s, multiplier=2.0: attempt 1 -> 1s, attempt 2 -> 2s,
    /// attempt 3 -> 4s, capped at `max_delay`. Jitter only ever adds, so
    /// consecutive retry times stay non-decreasing as long as
    /// `multiplier > 1.0 + jitter`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = (base_secs * self.multiplier.powi(exp)).min(self.max_delay.as_secs_f64());

        let jitter_secs = if self.jitter > 0.0 && delay_secs > 0.0 {
            rand::thread_rng().gen_range(0.0..delay_secs * self.jitter)
        } else {
            0.0
        };

        Duration::from_secs_f64(delay_secs + jitter_secs)
    }
}
