//! Reconnect Backoff Generator
//!
//! Computes randomized exponential retry delays for live replication
//! reconnect attempts. Starts with a random delay below two seconds and
//! doubles on every failed attempt, never exceeding the configured ceiling.

use rand::Rng;

use crate::error::{Error, Result};

/// Default ceiling for a single retry delay (10 minutes)
pub const DEFAULT_MAX_DELAY_MS: u64 = 600_000;

/// Ceiling for the very first attempt (2 seconds)
pub const FIRST_ATTEMPT_CEILING_MS: u64 = 2_000;

/// Randomized exponential backoff generator.
///
/// Purely functional from the caller's perspective: the previous delay goes
/// in, the next delay comes out. Nothing is persisted between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    max_delay_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl Backoff {
    /// Create a backoff generator with the given delay ceiling in milliseconds
    pub fn new(max_delay_ms: u64) -> Result<Self> {
        if max_delay_ms == 0 {
            return Err(Error::Config(
                "backoff max_delay_ms must be greater than zero".to_string(),
            ));
        }
        Ok(Self { max_delay_ms })
    }

    /// The configured delay ceiling in milliseconds
    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    /// Compute the next retry delay from the previous one.
    ///
    /// A zero previous delay means "first attempt" and draws uniformly from
    /// `[0, 2000)`. Otherwise the window is `[previous, previous * 2)`,
    /// clamped to `[ceiling / 2, ceiling)` once doubling would overshoot.
    pub fn next(&self, previous_ms: u64) -> u64 {
        self.next_bounded(previous_ms, None)
    }

    /// Like [`next`](Self::next), but with an explicit upper bound for this
    /// step. Bounds at or below the previous delay fall back to doubling.
    pub fn next_bounded(&self, previous_ms: u64, upper_ms: Option<u64>) -> u64 {
        let mut rng = rand::thread_rng();

        if previous_ms == 0 {
            return rng.gen_range(0..FIRST_ATTEMPT_CEILING_MS);
        }

        let mut min = previous_ms;
        let mut max = match upper_ms {
            Some(upper) if upper > min => upper + 1,
            _ => min.max(1).saturating_mul(2),
        };

        if max > self.max_delay_ms {
            min = self.max_delay_ms / 2;
            max = self.max_delay_ms;
        }

        if min >= max {
            return max.min(self.max_delay_ms);
        }

        rng.gen_range(min..max)
    }
}
