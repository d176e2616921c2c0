//! Bounded retry policy shared by store fetches and verification polling
//!
//! Every loop that waits on an external party goes through a `RetryPolicy`
//! so it has an attempt ceiling.

use rand::Rng;
use std::time::Duration;

/// Default number of attempts per fetch
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound on any single exponential delay
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay between every attempt
    Fixed,
    /// Delay doubles after each attempt, capped, with up to 10% jitter
    Exponential { max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least 1
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff: Backoff::Exponential {
                max: DEFAULT_MAX_BACKOFF,
            },
        }
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based)
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after attempt number `attempt` (1-based) failed
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential { max } => {
                let exp = attempt.saturating_sub(1).min(16);
                let delay = self.base_delay.saturating_mul(1u32 << exp).min(max);
                let jitter_ms = (delay.as_millis() as u64) / 10;
                if jitter_ms == 0 {
                    delay
                } else {
                    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_INTERVAL)
    }
}
