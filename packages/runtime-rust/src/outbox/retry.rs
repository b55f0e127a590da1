//! Retry policy: decides between another attempt and dead-lettering.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ExecutionFault;

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDelay {
    Fixed(Duration),
    /// `initial * multiplier^(attempt - 1)`, capped at `max`.
    Backoff {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

/// Delay policy kind as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayPolicy {
    #[default]
    Fixed,
    Backoff,
}

/// What to do with an envelope after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    DeadLetter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 behave as 1.
    pub max_attempts: u32,
    pub delay: RetryDelay,
    /// Adds up to this fraction of the delay at random (0.0 disables jitter).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: RetryDelay::Fixed(Duration::from_millis(100)),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay: RetryDelay::Fixed(delay),
            jitter: 0.0,
        }
    }

    #[must_use]
    pub fn backoff(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            delay: RetryDelay::Backoff {
                initial,
                max,
                multiplier: 2.0,
            },
            jitter: 0.0,
        }
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Decide the fate of an envelope whose attempt failed with `fault`.
    ///
    /// `attempts` is the number of attempts consumed so far, including the one
    /// that just failed. Interruptions always retry regardless of `attempts`.
    #[must_use]
    pub fn decide(&self, attempts: u32, fault: &ExecutionFault) -> RetryDecision {
        if fault.is_interruption() {
            return RetryDecision::Retry {
                delay: self.delay_for(attempts.max(1)),
            };
        }
        self.decide_attempt(attempts)
    }

    /// Decision for a plain failure after `attempts` attempts.
    #[must_use]
    pub fn decide_attempt(&self, attempts: u32) -> RetryDecision {
        if attempts >= self.max_attempts.max(1) {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Retry {
                delay: self.delay_for(attempts),
            }
        }
    }

    /// Delay before the attempt following attempt number `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = match self.delay {
            RetryDelay::Fixed(delay) => delay,
            RetryDelay::Backoff {
                initial,
                max,
                multiplier,
            } => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let scaled = initial.as_secs_f64() * multiplier.max(1.0).powi(exponent);
                if scaled.is_finite() && scaled < max.as_secs_f64() {
                    Duration::from_secs_f64(scaled)
                } else {
                    max
                }
            }
        };
        if self.jitter > 0.0 {
            let extra = rand::rng().random_range(0.0..=self.jitter);
            base + base.mul_f64(extra)
        } else {
            base
        }
    }
}
