//! Reconnect backoff.
//!
//! The delay before attempt `n` is `base_delay * n^2`. The supervisor gives
//! up once `n` reaches `max_attempts`.

use std::time::Duration;

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Multiplied by the square of the attempt number.
    ///
    /// Default: 5 seconds
    pub base_delay: Duration,

    /// Consecutive failures after which the supervisor terminates.
    ///
    /// Default: 6
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_attempts: 6,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    /// Delay scheduled after the `attempt`-th consecutive failure.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.saturating_mul(attempt))
    }
}

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Wait `delay`, then reconnect.
    Retry { attempt: u32, delay: Duration },
    /// The ceiling was hit.
    Exhausted { attempts: u32 },
}

/// Consecutive failure counter owned by the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    attempt: u32,
    next_delay: Duration,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&self) -> Duration {
        self.next_delay
    }

    /// Called once a connection succeeded.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_delay = Duration::ZERO;
    }

    /// Counts a failure and decides between backing off and giving up.
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> BackoffDecision {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt >= policy.max_attempts {
            self.next_delay = Duration::ZERO;
            return BackoffDecision::Exhausted {
                attempts: self.attempt,
            };
        }
        self.next_delay = policy.delay_for(self.attempt);
        BackoffDecision::Retry {
            attempt: self.attempt,
            delay: self.next_delay,
        }
    }
}
