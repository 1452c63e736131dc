//! Deciding whether a failed attempt should be retried.
use std::{fmt, sync::Arc};

use chrono::TimeDelta;

use crate::{
    backoff::{BackoffStrategy, Strategy},
    work::WorkError,
};

/// The outcome of consulting a [`RetryPolicy`] after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run another attempt once the delay has elapsed.
    RetryAfter(TimeDelta),
    /// Record the error and move the job to failed.
    GiveUp,
}

/// How many attempts a job gets and how long to wait between them.
///
/// # Example
///
/// ```
/// # use jobqueue::prelude::*;
/// # use chrono::TimeDelta;
/// let policy = RetryPolicy::new(3, BackoffStrategy::exponential(TimeDelta::seconds(1)));
/// let error = WorkError::transient("rate limited");
///
/// assert_eq!(policy.decide(1, &error), RetryDecision::RetryAfter(TimeDelta::seconds(1)));
/// assert_eq!(policy.decide(2, &error), RetryDecision::RetryAfter(TimeDelta::seconds(2)));
/// assert_eq!(policy.decide(3, &error), RetryDecision::GiveUp);
/// assert_eq!(policy.decide(1, &WorkError::permanent("bad input")), RetryDecision::GiveUp);
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Arc<dyn Strategy + Send + Sync>,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_BACKOFF: TimeDelta = TimeDelta::seconds(1);

    /// A policy allowing `max_attempts` attempts in total. At least one attempt is always made.
    pub fn new(max_attempts: u32, backoff: impl Strategy + Send + Sync + 'static) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Arc::new(backoff),
        }
    }

    /// A policy making a single attempt.
    pub fn no_retry() -> Self {
        Self::new(1, BackoffStrategy::constant(TimeDelta::zero()))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides the fate of a job that has made `attempt_count` attempts, the last of which
    /// failed with `error`.
    pub fn decide(&self, attempt_count: u32, error: &WorkError) -> RetryDecision {
        if !error.is_transient() || attempt_count >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.backoff.backoff(attempt_count))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_MAX_ATTEMPTS,
            BackoffStrategy::constant(Self::DEFAULT_BACKOFF),
        )
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_policy_makes_three_attempts() {
        let policy = RetryPolicy::default();
        let error = WorkError::transient("flaky");

        assert_eq!(
            policy.decide(1, &error),
            RetryDecision::RetryAfter(TimeDelta::seconds(1))
        );
        assert_eq!(
            policy.decide(2, &error),
            RetryDecision::RetryAfter(TimeDelta::seconds(1))
        );
        assert_eq!(policy.decide(3, &error), RetryDecision::GiveUp);
    }

    #[test]
    fn permanent_errors_are_never_retried() {
        let policy = RetryPolicy::new(10, BackoffStrategy::constant(TimeDelta::zero()));

        assert_eq!(
            policy.decide(1, &WorkError::permanent("nope")),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.decide(1, &WorkError::cancelled()),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn at_least_one_attempt() {
        let policy = RetryPolicy::new(0, BackoffStrategy::constant(TimeDelta::zero()));

        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(
            policy.decide(1, &WorkError::transient("flaky")),
            RetryDecision::GiveUp
        );
        assert_eq!(RetryPolicy::no_retry().max_attempts(), 1);
    }

    #[test]
    fn overrun_attempt_count_gives_up() {
        let policy = RetryPolicy::default();

        assert_eq!(
            policy.decide(7, &WorkError::transient("flaky")),
            RetryDecision::GiveUp
        );
    }
}
