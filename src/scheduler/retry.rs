//! Retry policy for node executions.
//!
//! A node's policy comes from its thought's declared [`RetrySpec`], with the
//! engine's [`RetryDefaults`] filling any field the declaration leaves out.
//! Thoughts that declare no retry run exactly once.
//!
//! Only retryable failures (transient errors and timeouts) are retried;
//! capability denials, permanent errors and cancellation end the node at once.

use crate::config::RetryDefaults;
use crate::sandbox::ErrorKind;
use crate::thought::{Backoff, RetrySpec};
use rand::Rng;
use std::time::Duration;

/// Backoff strategy between attempts.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Delay doubles each time, capped at `max_delay`
    Exponential {
        /// Delay before the first retry.
        initial_delay: Duration,
        /// Upper bound.
        max_delay: Duration,
        /// Growth factor per retry.
        multiplier: f64,
    },
    /// Delay increases by `increment` each time
    Linear {
        /// Delay before the first retry.
        initial_delay: Duration,
        /// Added per further retry.
        increment: Duration,
    },
}

/// Resolved retry policy for one node.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; always at least 1.
    pub max_attempts: u32,
    /// Backoff strategy.
    pub strategy: RetryStrategy,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            strategy: RetryStrategy::Fixed(Duration::ZERO),
            jitter: false,
        }
    }

    /// Resolve a thought's declared retry against engine defaults.
    pub fn resolve(spec: Option<&RetrySpec>, defaults: &RetryDefaults) -> Self {
        let Some(spec) = spec else {
            return Self::once();
        };
        let strategy = match &spec.backoff {
            Some(Backoff::Fixed { delay_ms }) => RetryStrategy::Fixed(Duration::from_millis(*delay_ms)),
            Some(Backoff::Exponential { initial_ms, max_ms }) => RetryStrategy::Exponential {
                initial_delay: Duration::from_millis(*initial_ms),
                max_delay: Duration::from_millis(*max_ms),
                multiplier: 2.0,
            },
            Some(Backoff::Linear {
                initial_ms,
                increment_ms,
            }) => RetryStrategy::Linear {
                initial_delay: Duration::from_millis(*initial_ms),
                increment: Duration::from_millis(*increment_ms),
            },
            None => RetryStrategy::Exponential {
                initial_delay: Duration::from_millis(defaults.base_delay_ms),
                max_delay: Duration::from_millis(defaults.max_delay_ms),
                multiplier: 2.0,
            },
        };
        Self {
            max_attempts: spec.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            strategy,
            jitter: spec.jitter,
        }
    }

    /// Delay after failed attempt `attempt` (1-based), before jitter.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let n = attempt.saturating_sub(1);
        match &self.strategy {
            RetryStrategy::Fixed(delay) => *delay,
            RetryStrategy::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let exp = i32::try_from(n).unwrap_or(i32::MAX);
                let ms = initial_delay.as_millis() as f64 * multiplier.powi(exp);
                let capped = ms.min(max_delay.as_millis() as f64);
                Duration::from_millis(capped as u64)
            }
            RetryStrategy::Linear {
                initial_delay,
                increment,
            } => initial_delay.saturating_add(increment.saturating_mul(n)),
        }
    }

    /// The wait before the next attempt, or `None` if the node should fail
    /// now: the error is not retryable or attempts are exhausted.
    pub fn next_delay(&self, kind: ErrorKind, attempt: u32) -> Option<Duration> {
        if !kind.is_retryable() || attempt >= self.max_attempts {
            return None;
        }
        let delay = self.calculate_delay(attempt);
        Some(if self.jitter { with_jitter(delay) } else { delay })
    }
}

/// Retry with jitter to prevent thundering herd
pub fn with_jitter(duration: Duration) -> Duration {
    let quarter = duration.as_millis() / 4;
    if quarter == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0..quarter);
    duration + Duration::from_millis(u64::try_from(jitter).unwrap_or(0))
}
