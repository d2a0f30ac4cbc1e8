// Retry planning: exponential backoff with jitter
use rand::Rng;
use std::time::Duration;
use tracing::{info, warn};

/// Lower bound of the jitter factor
pub const JITTER_MIN: f64 = 0.75;

/// Upper bound of the jitter factor
pub const JITTER_MAX: f64 = 1.25;

/// Exponent cap (2^20 * base is already far beyond any sane retry horizon)
const MAX_BACKOFF_EXPONENT: i32 = 20;

/// Retry decision result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again after `delay`
    Retry { delay: Duration },
    /// Retry budget spent, job goes to FAILED
    Exhausted,
}

/// Maps (attempt, base delay) to the next-attempt delay
///
/// Backoff formula:
/// delay = 2^attempt * base * jitter, jitter uniform in [0.75, 1.25]
///
/// `attempt` is 1-indexed: the attempt that just failed. Jitter is sampled
/// fresh on every call so that jobs failing together spread out.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPlanner;

impl RetryPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Compute the delay before the next attempt
    ///
    /// # Arguments
    /// * `attempt` - Attempt that just failed (1-indexed; values below 1 are treated as 1)
    /// * `base_delay` - Base delay of the job type
    pub fn compute_delay(&self, attempt: i32, base_delay: Duration) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        Self::delay_with_jitter(attempt, base_delay, jitter)
    }

    /// Deterministic part of `compute_delay`
    pub fn delay_with_jitter(attempt: i32, base_delay: Duration, jitter: f64) -> Duration {
        let exponent = attempt.clamp(1, MAX_BACKOFF_EXPONENT);
        let secs = 2f64.powi(exponent) * base_delay.as_secs_f64() * jitter;
        // Saturate instead of panicking on an absurd base delay
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// True while `attempt < max_attempts`
    pub fn should_retry(&self, attempt: i32, max_attempts: i32) -> bool {
        attempt < max_attempts
    }

    /// Decide what happens after a failed attempt
    pub fn plan(&self, attempt: i32, max_attempts: i32, base_delay: Duration) -> RetryDecision {
        if !self.should_retry(attempt, max_attempts) {
            warn!(
                attempt = attempt,
                max_attempts = max_attempts,
                "Max retry attempts reached"
            );
            return RetryDecision::Exhausted;
        }

        let delay = self.compute_delay(attempt, base_delay);
        info!(
            attempt = attempt,
            max_attempts = max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry"
        );
        RetryDecision::Retry { delay }
    }
}
