//! Retry configuration, backoff and the per-step retry decision.

use crate::core::StepRetry;
use crate::definition::StepDefinition;
use crate::errors::ErrorModel;
use crate::eval::{EvalContext, Expr, ExpressionEvaluator};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = min_interval
    #[default]
    Constant,
    /// delay = min_interval * attempt
    Linear,
    /// delay = min_interval * 2^(attempt - 1)
    Exponential,
}

/// Jitter strategy to prevent thundering herd.
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

/// The `retry` block of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the initial one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff strategy.
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Base delay in milliseconds.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
    /// Retry only while this condition holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_condition: Option<Expr>,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_min_interval_ms() -> u64 {
    1000
}

const fn default_max_interval_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            strategy: BackoffStrategy::default(),
            min_interval_ms: default_min_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            jitter: JitterStrategy::default(),
            if_condition: None,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub const fn with_min_interval_ms(mut self, delay: u64) -> Self {
        self.min_interval_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub const fn with_max_interval_ms(mut self, delay: u64) -> Self {
        self.max_interval_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Retries only while `condition` evaluates to true.
    #[must_use]
    pub fn with_if(mut self, condition: impl Into<Expr>) -> Self {
        self.if_condition = Some(condition.into());
        self
    }

    /// Delay before the given retry (1-based).
    #[must_use]
    pub fn calculate_backoff(&self, retry: u32) -> Duration {
        let base = self.min_interval_ms;
        let max = self.max_interval_ms.max(base);
        let retry = retry.max(1);

        let delay = match self.strategy {
            BackoffStrategy::Constant => base,
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry)),
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(retry - 1))
            }
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

/// Decides whether a failed step is retried.
///
/// Returns `Ok(None)` when the step has no retry block, the retry condition
/// is false, or attempts are exhausted. The initial attempt counts toward
/// `max_attempts`.
pub fn calculate_retry(
    current: Option<&StepRetry>,
    step: &StepDefinition,
    evaluator: &dyn ExpressionEvaluator,
    ctx: &EvalContext,
) -> Result<Option<StepRetry>, ErrorModel> {
    let Some(config) = step.retry_config() else {
        return Ok(None);
    };

    if let Some(condition) = &config.if_condition {
        if !evaluator.evaluate_bool(condition, ctx)? {
            tracing::debug!(step = %step.full_name(), "Retry condition not met");
            return Ok(None);
        }
    }

    let count = current.map_or(0, |retry| retry.count) + 1;
    if count > config.max_attempts.saturating_sub(1) {
        tracing::debug!(step = %step.full_name(), count, "Retries exhausted");
        return Ok(None);
    }

    Ok(Some(StepRetry {
        count,
        input: None,
        retry_completed: false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StepType;
    use crate::eval::PathEvaluator;

    fn step_with_retry(config: RetryConfig) -> StepDefinition {
        StepDefinition::new(StepType::Http, "fetch").with_retry(config)
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.strategy, BackoffStrategy::Constant);
        assert_eq!(config.min_interval_ms, 1000);
        assert_eq!(config.max_interval_ms, 10_000);
    }

    #[test]
    fn test_backoff_strategies() {
        let constant = RetryConfig::new().with_min_interval_ms(100);
        assert_eq!(constant.calculate_backoff(5), Duration::from_millis(100));

        let linear = RetryConfig::new()
            .with_min_interval_ms(100)
            .with_strategy(BackoffStrategy::Linear);
        assert_eq!(linear.calculate_backoff(3), Duration::from_millis(300));

        let exponential = RetryConfig::new()
            .with_min_interval_ms(100)
            .with_strategy(BackoffStrategy::Exponential);
        assert_eq!(exponential.calculate_backoff(1), Duration::from_millis(100));
        assert_eq!(exponential.calculate_backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_capped_at_max() {
        let config = RetryConfig::new()
            .with_min_interval_ms(1000)
            .with_max_interval_ms(5000)
            .with_strategy(BackoffStrategy::Exponential);
        assert_eq!(config.calculate_backoff(10), Duration::from_millis(5000));
    }

    #[test]
    fn test_backoff_full_jitter_bounded() {
        let config = RetryConfig::new()
            .with_min_interval_ms(100)
            .with_jitter(JitterStrategy::Full);
        for _ in 0..10 {
            assert!(config.calculate_backoff(1) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_calculate_retry_counts_initial_attempt() {
        let step = step_with_retry(RetryConfig::new().with_max_attempts(3));
        let ctx = EvalContext::default();

        let first = calculate_retry(None, &step, &PathEvaluator, &ctx).unwrap().unwrap();
        assert_eq!(first.count, 1);
        let second = calculate_retry(Some(&first), &step, &PathEvaluator, &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(second.count, 2);
        assert!(calculate_retry(Some(&second), &step, &PathEvaluator, &ctx)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_calculate_retry_without_block() {
        let step = StepDefinition::new(StepType::Http, "fetch");
        let retry = calculate_retry(None, &step, &PathEvaluator, &EvalContext::default());
        assert!(retry.unwrap().is_none());
    }

    #[test]
    fn test_calculate_retry_condition() {
        let step = step_with_retry(RetryConfig::new().with_if("false"));
        let retry = calculate_retry(None, &step, &PathEvaluator, &EvalContext::default());
        assert!(retry.unwrap().is_none());

        let step = step_with_retry(RetryConfig::new().with_if("result.nope"));
        assert!(calculate_retry(None, &step, &PathEvaluator, &EvalContext::default()).is_err());
    }
}
