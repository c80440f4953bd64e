//! Retry policy for transient handler failures.

use std::time::Duration;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same interval between every attempt.
    Fixed(Duration),

    /// `base * 2^(attempt-1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

/// Configuration for retrying a handler invocation.
///
/// `max_attempts` includes the initial attempt; exhausting it routes the
/// message to the fault queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Delay growth between attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    /// Three attempts at one-second intervals.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_secs(1)),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }

    /// Returns true if another attempt should be made after `attempt`
    /// (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// The delay to wait after `attempt` (1-based) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(interval) => interval,
            Backoff::Exponential { base, max } => {
                let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(multiplier).min(max)
            }
        }
    }
}
