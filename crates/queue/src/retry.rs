//! Retry decisions for failed dispatch attempts.

use chrono::{DateTime, Duration, Utc};

use crate::settings::{BackoffStrategy, ValidatedSettings};

/// Upper bound on any computed retry delay.
const MAX_RETRY_DELAY_HOURS: i64 = 24;

/// What happens to a lead whose dispatch just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `queued`, not eligible again before `failed_at + delay`.
    RetryAfter(Duration),
    /// Attempts exhausted; the lead ends in `failed`.
    PermanentFailure,
}

impl RetryDecision {
    /// The instant the lead becomes eligible again, if it will be retried.
    pub fn retry_at(self, failed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            RetryDecision::RetryAfter(delay) => Some(failed_at + delay),
            RetryDecision::PermanentFailure => None,
        }
    }
}

/// Retry policy derived from a project's settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub retry_attempts: u32,
    pub base_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl RetryPolicy {
    pub fn from_settings(settings: &ValidatedSettings) -> Self {
        Self {
            retry_attempts: settings.retry_attempts(),
            base_delay: settings.retry_delay(),
            strategy: settings.backoff(),
        }
    }

    /// Decide given the attempt count *after* the failed attempt was counted.
    pub fn decide(&self, attempts: u32) -> RetryDecision {
        if attempts <= self.retry_attempts {
            RetryDecision::RetryAfter(self.delay_for_attempt(attempts))
        } else {
            RetryDecision::PermanentFailure
        }
    }

    /// Delay before the retry that follows attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let max = Duration::hours(MAX_RETRY_DELAY_HOURS);
        let attempt = attempt.max(1);

        let delay = match self.strategy {
            BackoffStrategy::Fixed => return self.base_delay,
            BackoffStrategy::Linear => i32::try_from(attempt)
                .ok()
                .and_then(|factor| self.base_delay.checked_mul(factor)),
            BackoffStrategy::Exponential => 2_i32
                .checked_pow(attempt - 1)
                .and_then(|factor| self.base_delay.checked_mul(factor)),
        };

        delay.map_or(max, |d| d.min(max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(retry_attempts: u32, strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            retry_attempts,
            base_delay: Duration::minutes(5),
            strategy,
        }
    }

    #[test]
    fn retries_until_attempts_exceed_budget() {
        let p = policy(2, BackoffStrategy::Fixed);

        assert_eq!(p.decide(1), RetryDecision::RetryAfter(Duration::minutes(5)));
        assert_eq!(p.decide(2), RetryDecision::RetryAfter(Duration::minutes(5)));
        assert_eq!(p.decide(3), RetryDecision::PermanentFailure);
    }

    #[test]
    fn zero_retries_fails_on_first_error() {
        let p = policy(0, BackoffStrategy::Fixed);
        assert_eq!(p.decide(1), RetryDecision::PermanentFailure);
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let p = policy(5, BackoffStrategy::Linear);

        assert_eq!(p.delay_for_attempt(1), Duration::minutes(5));
        assert_eq!(p.delay_for_attempt(2), Duration::minutes(10));
        assert_eq!(p.delay_for_attempt(3), Duration::minutes(15));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let p = policy(40, BackoffStrategy::Exponential);

        assert_eq!(p.delay_for_attempt(1), Duration::minutes(5));
        assert_eq!(p.delay_for_attempt(2), Duration::minutes(10));
        assert_eq!(p.delay_for_attempt(3), Duration::minutes(20));
        assert_eq!(p.delay_for_attempt(12), Duration::hours(MAX_RETRY_DELAY_HOURS));
        assert_eq!(p.delay_for_attempt(40), Duration::hours(MAX_RETRY_DELAY_HOURS));
    }

    #[test]
    fn retry_at_is_relative_to_failure() {
        let failed_at = Utc::now();
        let decision = policy(1, BackoffStrategy::Fixed).decide(1);

        assert_eq!(decision.retry_at(failed_at), Some(failed_at + Duration::minutes(5)));
        assert_eq!(RetryDecision::PermanentFailure.retry_at(failed_at), None);
    }
}
