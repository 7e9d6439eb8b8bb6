//! Whole-task retry policy

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Delay growth strategy between task attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// No delay between attempts
    None,

    /// Constant `initial_delay_ms` between attempts
    Fixed,

    /// Delay doubles each retry, capped at `max_delay_ms`
    #[default]
    Exponential,
}

/// Retry configuration for a whole task
///
/// The attempt counter lives outside the per-attempt context, so it
/// survives the context reset a retry performs.
///
/// # Example
///
/// ```
/// use capstan_model::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_delay(Duration::from_secs(1))
///     .with_max_delay(Duration::from_secs(30));
///
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Delay growth strategy
    pub backoff: Backoff,

    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,

    /// Cap on any single delay, in milliseconds
    pub max_delay_ms: u64,

    /// Jitter factor (0.0-1.0) added to each delay; 0 keeps delays exact
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            jitter: 0.0,
        }
    }

    /// Exponential backoff with sensible defaults
    ///
    /// 3 attempts, 1 second initial delay, 60 second cap, no jitter.
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: 0.0,
        }
    }

    /// Fixed delay between attempts
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed,
            initial_delay_ms: delay.as_millis() as u64,
            max_delay_ms: delay.as_millis() as u64,
            jitter: 0.0,
        }
    }

    /// Set the maximum number of attempts (minimum 1)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the delay before the first retry
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the cap on any single delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Whether another attempt may start after `attempts` have run
    pub fn has_attempts_remaining(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay to wait before the given attempt number (1-based)
    ///
    /// Attempt 1 is the initial execution and has no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let base_ms = match self.backoff {
            Backoff::None => 0,
            Backoff::Fixed => self.initial_delay_ms,
            Backoff::Exponential => {
                let exponent = (attempt - 2).min(62);
                self.initial_delay_ms.saturating_mul(1u64 << exponent)
            }
        };
        let capped = base_ms.min(self.max_delay_ms);

        let jittered = if self.jitter > 0.0 && capped > 0 {
            let range = capped as f64 * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..range);
            (capped as f64 + offset).max(0.0) as u64
        } else {
            capped
        };

        Duration::from_millis(jittered)
    }
}
