//! Exponential backoff with jitter.
//!
//! One policy type serves both reconnection scheduling and request retries;
//! each use site carries its own parameters.

use rand::Rng;
use std::time::Duration;

/// Parameters of an exponential backoff curve
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first attempt
    pub base_delay: Duration,
    /// Upper bound on the un-jittered delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub growth_factor: f64,
    /// Upper bound of the uniform jitter added on top
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            growth_factor: 2.0,
            jitter: Duration::from_millis(500),
        }
    }
}

impl BackoffPolicy {
    /// Deterministic part of the delay for a 1-based attempt number.
    ///
    /// `min(max_delay, base_delay * growth_factor^(attempt-1))`; attempt 0 is
    /// treated as 1.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.growth_factor.max(1.0).powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_micros((secs * 1e6).round() as u64).min(self.max_delay)
    }

    /// Full delay for a 1-based attempt number, including jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay_for(attempt).saturating_add(self.sample_jitter())
    }

    /// Largest value [`BackoffPolicy::delay`] can return
    pub fn ceiling(&self) -> Duration {
        self.max_delay.saturating_add(self.jitter)
    }

    fn sample_jitter(&self) -> Duration {
        let bound = u64::try_from(self.jitter.as_micros()).unwrap_or(u64::MAX);
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(0..=bound))
    }
}

/// Per-exchange retry budget walking a backoff curve.
///
/// Each call to [`RetryState::next_delay`] consumes one retry and returns how
/// long to wait before resubmitting, or `None` once the budget is spent.
#[derive(Clone, Debug)]
pub struct RetryState {
    policy: BackoffPolicy,
    remaining: u32,
    retries_used: u32,
    current_delay: Duration,
}

impl RetryState {
    /// Start with `budget` retries available
    pub fn new(policy: BackoffPolicy, budget: u32) -> Self {
        Self {
            policy,
            remaining: budget,
            retries_used: 0,
            current_delay: Duration::ZERO,
        }
    }

    /// Retries still available
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Delay used before the most recent retry (zero before the first)
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Transmissions made so far, counting the initial one
    pub fn attempts(&self) -> u32 {
        self.retries_used + 1
    }

    /// Consume one retry and return the delay before it
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.retries_used += 1;
        self.current_delay = self.policy.delay(self.retries_used);
        Some(self.current_delay)
    }
}
