//! Retry policies shared by stages and the orchestrator.
//!
//! A policy answers two questions: may attempt `n` be retried, and how long
//! to wait before it. Stages count retries per unit and stage; the
//! orchestrator counts them per child run.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base
    #[default]
    Constant,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base * 2^attempt
    Exponential,
}

/// Jitter applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// How many times, and how far apart, to retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub limit: u32,
    /// Base delay between retries.
    #[serde(with = "crate::utils::duration_ms")]
    pub delay: Duration,
    /// Cap applied after backoff.
    #[serde(with = "crate::utils::duration_ms", default = "default_max_delay")]
    pub max_delay: Duration,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60 * 60)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::ZERO)
    }
}

impl RetryPolicy {
    /// A constant-delay policy without jitter.
    #[must_use]
    pub fn new(limit: u32, delay: Duration) -> Self {
        Self {
            limit,
            delay,
            max_delay: default_max_delay(),
            backoff: BackoffStrategy::Constant,
            jitter: JitterStrategy::None,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// True if a unit that has been retried `retries` times may be retried again.
    #[must_use]
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.limit
    }

    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let delay = match self.backoff {
            BackoffStrategy::Constant => base,
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt) + 1),
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(attempt)),
        }
        .min(max);

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_below_limit() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::none().should_retry(0));
    }

    #[test]
    fn test_constant_delay() {
        let policy = RetryPolicy::new(1, Duration::from_secs(20));
        assert_eq!(policy.delay_for(0), Duration::from_secs(20));
        assert_eq!(policy.delay_for(4), Duration::from_secs(20));
    }

    #[test]
    fn test_linear_and_exponential_backoff() {
        let linear = RetryPolicy::new(5, Duration::from_millis(100)).with_backoff(BackoffStrategy::Linear);
        assert_eq!(linear.delay_for(2), Duration::from_millis(300));

        let exponential =
            RetryPolicy::new(5, Duration::from_millis(100)).with_backoff(BackoffStrategy::Exponential);
        assert_eq!(exponential.delay_for(0), Duration::from_millis(100));
        assert_eq!(exponential.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1))
            .with_backoff(BackoffStrategy::Exponential)
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let full = RetryPolicy::new(1, Duration::from_millis(100)).with_jitter(JitterStrategy::Full);
        let equal = RetryPolicy::new(1, Duration::from_millis(100)).with_jitter(JitterStrategy::Equal);
        for _ in 0..20 {
            assert!(full.delay_for(0) <= Duration::from_millis(100));
            let d = equal.delay_for(0);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_serde_uses_milliseconds() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"limit": 2, "delay": 1500}"#).unwrap();
        assert_eq!(policy.delay, Duration::from_millis(1500));
        assert_eq!(policy.backoff, BackoffStrategy::Constant);
        assert_eq!(policy.max_delay, Duration::from_secs(3600));
    }
}
