//! Reconnect backoff with optional jitter.
//!
//! Delays grow as `base * 2^attempt` up to `max_delay`. Jitter spreads the
//! reconnects of many relays that failed at the same moment (for example when
//! the device drops off the network) so they do not all retry in lockstep.

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Jitter strategy to apply to backoff delays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// No jitter; always return the capped exponential delay.
    None,
    /// Full jitter; return a random delay in `[0, capped_delay]`.
    Full,
    /// Add a random amount in `[0, capped_delay / 2]`, never exceeding `max_delay`.
    ///
    /// Consecutive delays stay non-decreasing because the next un-jittered step
    /// is always at least 1.5x the current jittered one (or already capped).
    #[default]
    Partial,
}

/// Exponential backoff calculator.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    jitter: Jitter,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff sequence. There is no attempt limit: relays are
    /// retried until the caller removes them.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: Jitter::default(),
            attempt: 0,
        }
    }

    /// Override the jitter strategy.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Capped, un-jittered delay for a given attempt index.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();
        let multiplier = 1u128.checked_shl(attempt.min(63)).unwrap_or(u128::MAX);
        let capped_ms = base_ms.saturating_mul(multiplier).min(max_ms);
        Duration::from_millis(capped_ms.min(u64::MAX as u128) as u64)
    }

    /// Get the next delay in the sequence and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let capped = self.base_delay_for(self.attempt);
        let capped_ms = capped.as_millis().min(u64::MAX as u128) as u64;

        let delay_ms = match self.jitter {
            Jitter::None => capped_ms,
            Jitter::Full => rand::rng().random_range(0..=capped_ms),
            Jitter::Partial => {
                let max_ms = self.max_delay.as_millis().min(u64::MAX as u128) as u64;
                let extra = rand::rng().random_range(0..=capped_ms / 2);
                capped_ms.saturating_add(extra).min(max_ms)
            }
        };

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(delay_ms)
    }

    /// Reset the attempt counter.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Current attempt count (number of delays generated so far).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(512))
    }
}
