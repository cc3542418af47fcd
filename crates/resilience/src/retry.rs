//! Retry policies.
//!
//! A [`RetryPolicy`] is a pure function from attempt number to delay; the
//! loop that applies it lives on
//! [`CircuitBreaker::execute_with_retry`](crate::CircuitBreaker::execute_with_retry).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ResilienceError;

/// Backoff shape applied between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// No delay between attempts.
    None,
    /// `base_delay` between every pair of attempts.
    Fixed,
    /// `base_delay * 2^attempt`, capped at `max_delay`.
    Exponential,
    /// Exponential with equal jitter: half the computed delay is kept, the
    /// other half is randomized to avoid thundering herds.
    ExponentialJitter,
}

/// A validated retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first (must be >= 1).
    pub max_attempts: u32,
    /// Delay shape between attempts.
    pub backoff: Backoff,
    /// Base delay fed into the backoff computation.
    pub base_delay: Duration,
    /// Ceiling no computed delay may exceed.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Create a validated policy.
    pub fn new(
        max_attempts: u32,
        backoff: Backoff,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Result<Self, ResilienceError> {
        let policy = Self {
            max_attempts,
            backoff,
            base_delay,
            max_delay,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Validate the policy's parameters.
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::invalid_config(
                "max_attempts must be at least 1",
            ));
        }
        if self.backoff != Backoff::None && self.max_delay < self.base_delay {
            return Err(ResilienceError::invalid_config(
                "max_delay must be >= base_delay",
            ));
        }
        Ok(())
    }

    /// Delay to sleep after the attempt with the given zero-based index.
    ///
    /// Pure apart from jitter randomness; the jittered delay never exceeds
    /// the un-jittered one.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let computed = match self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential | Backoff::ExponentialJitter => {
                let millis = (self.base_delay.as_millis() as u64)
                    .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
                Duration::from_millis(millis)
            }
        };
        let capped = computed.min(self.max_delay);

        if self.backoff == Backoff::ExponentialJitter {
            let millis = capped.as_millis() as u64;
            let half = millis / 2;
            let jitter = if half > 0 { fastrand::u64(0..=half) } else { 0 };
            Duration::from_millis(half + jitter)
        } else {
            capped
        }
    }
}
