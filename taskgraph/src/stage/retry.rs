//! Per-stage retry policy with optional backoff and jitter.
//!
//! A retried task goes back on the stage's own input queue. With the
//! default `base_delay_ms` of zero it is re-dispatched as soon as it is
//! dequeued again; otherwise the computed delay is slept at the start of
//! the re-dispatched unit.

use crate::task::{kinds, TaskError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^(retry - 1)
    #[default]
    Exponential,
    /// delay = base * retry
    Linear,
    /// delay = base
    Constant,
}

/// Jitter applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Use the computed delay as is.
    #[default]
    None,
    /// Random from 0 to the computed delay.
    Full,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// The error is retryable but the budget is spent.
    GiveUp,
    /// The error kind is not retryable.
    NotRetryable,
}

/// Retry classifier and budget of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retries per task.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Error kinds that are retried.
    #[serde(default = "default_retryable_kinds")]
    pub retryable_kinds: BTreeSet<String>,
    /// Base delay in milliseconds; zero retries immediately.
    #[serde(default)]
    pub base_delay_ms: u64,
    /// Upper bound for a single delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retryable_kinds() -> BTreeSet<String> {
    kinds::DEFAULT_RETRYABLE.iter().map(|k| (*k).to_string()).collect()
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retryable_kinds: default_retryable_kinds(),
            base_delay_ms: 0,
            max_delay_ms: default_max_delay_ms(),
            backoff_strategy: BackoffStrategy::default(),
            jitter_strategy: JitterStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the delay parameters.
    #[must_use]
    pub fn with_backoff(mut self, base_delay: Duration, strategy: BackoffStrategy) -> Self {
        self.base_delay_ms = u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX);
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = u64::try_from(max_delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Adds error kinds to the classifier.
    pub fn add_kinds<I, S>(&mut self, kinds: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_kinds.extend(kinds.into_iter().map(Into::into));
    }

    /// Returns true if the error kind is retryable.
    #[must_use]
    pub fn is_retryable(&self, error: &TaskError) -> bool {
        self.retryable_kinds.contains(&error.kind)
    }

    /// Decides what to do with a failure after `retries_so_far` retries.
    #[must_use]
    pub fn decide(&self, error: &TaskError, retries_so_far: u32) -> RetryDecision {
        if !self.is_retryable(error) {
            return RetryDecision::NotRetryable;
        }
        if retries_so_far >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(retries_so_far + 1))
    }

    /// Calculates the delay before the `retry`-th retry (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay_ms;
        if base == 0 {
            return Duration::ZERO;
        }
        let max = self.max_delay_ms;
        let step = retry.max(1);

        let delay = match self.backoff_strategy {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(step - 1)).min(max)
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(step)).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match self.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => rand::thread_rng().gen_range(0..=delay),
        };

        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_classifier_is_network_errors() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert!(policy.is_retryable(&TaskError::new(kinds::READ_TIMEOUT, "slow")));
        assert!(policy.is_retryable(&TaskError::new(kinds::CONNECT_ERROR, "refused")));
        assert!(!policy.is_retryable(&TaskError::new("ValueError", "bad")));
    }

    #[test]
    fn test_add_kinds_extends_classifier() {
        let mut policy = RetryPolicy::default();
        policy.add_kinds(["ValueError"]);
        assert!(policy.is_retryable(&TaskError::new("ValueError", "bad")));
    }

    #[test]
    fn test_decide_respects_budget() {
        let policy = RetryPolicy::default().with_max_retries(2);
        let err = TaskError::new(kinds::READ_ERROR, "reset");

        assert_eq!(policy.decide(&err, 0), RetryDecision::Retry(Duration::ZERO));
        assert_eq!(policy.decide(&err, 1), RetryDecision::Retry(Duration::ZERO));
        assert_eq!(policy.decide(&err, 2), RetryDecision::GiveUp);
        assert_eq!(
            policy.decide(&TaskError::new("KeyError", "x"), 0),
            RetryDecision::NotRetryable
        );
    }

    #[test]
    fn test_zero_budget_never_retries() {
        let policy = RetryPolicy::default().with_max_retries(0);
        let err = TaskError::new(kinds::READ_ERROR, "reset");
        assert_eq!(policy.decide(&err, 0), RetryDecision::GiveUp);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(100), BackoffStrategy::Exponential)
            .with_max_delay(Duration::from_millis(350));

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }

    #[test]
    fn test_linear_and_constant_backoff() {
        let linear = RetryPolicy::default()
            .with_backoff(Duration::from_millis(10), BackoffStrategy::Linear);
        assert_eq!(linear.delay_for(3), Duration::from_millis(30));

        let constant = RetryPolicy::default()
            .with_backoff(Duration::from_millis(10), BackoffStrategy::Constant);
        assert_eq!(constant.delay_for(5), Duration::from_millis(10));
    }

    #[test]
    fn test_full_jitter_stays_in_range() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(50), BackoffStrategy::Constant)
            .with_jitter(JitterStrategy::Full);
        for _ in 0..20 {
            assert!(policy.delay_for(1) <= Duration::from_millis(50));
        }
    }
}
