//! Backoff strategies used by [`crate::retry::RetryPolicy`] to space out retries.
//!
//! Three strategies are provided:
//!
//! 1. Constant
//! 2. Linear
//! 3. Exponential
//!
//! each of which can be made less predictable by applying [`Jitter`]. Jitter is opt in, a
//! strategy without it is fully deterministic.
//!
//! All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use jobqueue::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::milliseconds(500))
//!     .with_max(TimeDelta::seconds(4))
//!     .with_jitter(Jitter::Relative(0.1));
//!
//! assert!(strategy.backoff(1) >= TimeDelta::milliseconds(450));
//! assert!(strategy.backoff(1) <= TimeDelta::milliseconds(550));
//! assert!(strategy.backoff(3) >= TimeDelta::milliseconds(1800));
//! // The jitter applies on top of the max
//! assert!(strategy.backoff(10) <= TimeDelta::milliseconds(4400));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given the number of attempts made so far, starting at 1, returns the [`TimeDelta`] to
    /// wait before the next attempt.
    fn backoff(&self, attempt: u32) -> TimeDelta;
}

/// Constant backoff strategy.
///
/// __Note:__ This type cannot be constructed directly, instead [`BackoffStrategy::constant`]
/// should be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u32) -> TimeDelta {
        self.delay
    }
}

/// Exponential backoff strategy, doubling the delay after every attempt.
///
/// __Note:__ This type cannot be constructed directly, instead [`BackoffStrategy::exponential`]
/// should be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let factor = 2_i32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(i32::MAX);
        let backoff = self.base.checked_mul(factor).unwrap_or(TimeDelta::MAX);
        clamp(backoff, self.max)
    }
}

/// Linear backoff strategy.
///
/// __Note:__ This type cannot be constructed directly, instead [`BackoffStrategy::linear`]
/// should be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    factor: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Linear {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let attempt = i32::try_from(attempt).unwrap_or(i32::MAX);
        let backoff = self.factor.checked_mul(attempt).unwrap_or(TimeDelta::MAX);
        clamp(backoff, self.max)
    }
}

fn clamp(backoff: TimeDelta, max: Option<TimeDelta>) -> TimeDelta {
    match max {
        Some(max) => backoff.min(max),
        None => backoff,
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter to be added to the backoff in the range `-delta =< jitter =< delta`.
    Absolute(TimeDelta),
    /// A random jitter to be added as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds().abs(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio.abs()).round() as i64,
        };
        if milliseconds == 0 {
            return value;
        }
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value + TimeDelta::milliseconds(jitter)
    }
}

/// A backoff [`Strategy`] with optional jitter and a lower bound.
///
/// # Example
///
/// ```
/// # use jobqueue::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy = BackoffStrategy::linear(TimeDelta::seconds(10)).with_max(TimeDelta::seconds(25));
///
/// assert_eq!(strategy.backoff(1), TimeDelta::seconds(10));
/// assert_eq!(strategy.backoff(2), TimeDelta::seconds(20));
/// assert_eq!(strategy.backoff(3), TimeDelta::seconds(25));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Constant> {
    /// Creates a [`BackoffStrategy`] which always waits `delay`.
    ///
    /// # Example
    ///
    /// ```
    /// # use jobqueue::prelude::*;
    /// # use chrono::TimeDelta;
    /// let strategy = BackoffStrategy::constant(TimeDelta::seconds(1));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::seconds(1));
    /// assert_eq!(strategy.backoff(7), TimeDelta::seconds(1));
    /// ```
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    /// Creates a [`BackoffStrategy`] waiting `base * 2^(attempt - 1)`.
    ///
    /// It is advisable to bound the delay using [`BackoffStrategy::with_max`].
    ///
    /// # Example
    ///
    /// ```
    /// # use jobqueue::prelude::*;
    /// # use chrono::TimeDelta;
    /// let strategy =
    ///     BackoffStrategy::exponential(TimeDelta::seconds(1)).with_max(TimeDelta::seconds(5));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::seconds(1));
    /// assert_eq!(strategy.backoff(2), TimeDelta::seconds(2));
    /// assert_eq!(strategy.backoff(3), TimeDelta::seconds(4));
    /// assert_eq!(strategy.backoff(4), TimeDelta::seconds(5));
    /// ```
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl BackoffStrategy<Linear> {
    /// Creates a [`BackoffStrategy`] waiting `factor * attempt`.
    pub const fn linear(factor: TimeDelta) -> Self {
        Self::new(Linear { factor, max: None })
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    /// Wraps a custom [`Strategy`]. The built in strategies are more commonly constructed via
    /// [`BackoffStrategy::constant`], [`BackoffStrategy::linear`] or
    /// [`BackoffStrategy::exponential`].
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Add a jitter to the backoff strategy see [`Jitter`] for more information about how this
    /// affects the strategy.
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Add a minimum value. Useful to avoid very short delays when using a large jitter.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let mut backoff = self.strategy.backoff(attempt);

        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff);
        }

        backoff.max(self.min)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constant_backoff() {
        let delay = TimeDelta::seconds(1);
        let strategy = BackoffStrategy::constant(delay);

        for i in 1..100 {
            assert_eq!(strategy.backoff(i), delay);
        }
    }

    #[test]
    fn constant_backoff_with_absolute_jitter() {
        let delay = TimeDelta::minutes(1);
        let jitter = TimeDelta::seconds(10);
        let strategy = BackoffStrategy::constant(delay).with_jitter(Jitter::Absolute(jitter));

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff >= delay - jitter);
            assert!(backoff <= delay + jitter);
        }
    }

    #[test]
    fn constant_backoff_with_jitter_min() {
        let delay = TimeDelta::seconds(20);
        let jitter = TimeDelta::seconds(20);
        let min = TimeDelta::seconds(5);
        let strategy = BackoffStrategy::constant(delay)
            .with_jitter(Jitter::Absolute(jitter))
            .with_min(min);

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff >= min);
            assert!(backoff <= delay + jitter);
        }
    }

    #[test]
    fn linear_backoff() {
        let factor = TimeDelta::milliseconds(250);
        let strategy = BackoffStrategy::linear(factor);

        for i in 1..100 {
            assert_eq!(strategy.backoff(i), factor * i as i32);
        }
    }

    #[test]
    fn exponential_backoff_doubles() {
        let strategy = BackoffStrategy::exponential(TimeDelta::milliseconds(100));

        assert_eq!(strategy.backoff(1), TimeDelta::milliseconds(100));
        assert_eq!(strategy.backoff(2), TimeDelta::milliseconds(200));
        assert_eq!(strategy.backoff(3), TimeDelta::milliseconds(400));
        assert_eq!(strategy.backoff(4), TimeDelta::milliseconds(800));
    }

    #[test]
    fn exponential_backoff_saturates_at_max() {
        let max = TimeDelta::minutes(10);
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1)).with_max(max);

        assert_eq!(strategy.backoff(40), max);
        assert_eq!(strategy.backoff(u32::MAX), max);
    }

    #[test]
    fn exponential_backoff_with_relative_jitter() {
        let strategy =
            BackoffStrategy::exponential(TimeDelta::seconds(1)).with_jitter(Jitter::Relative(0.5));

        for _ in 1..100 {
            let backoff = strategy.backoff(2);
            assert!(backoff >= TimeDelta::seconds(1));
            assert!(backoff <= TimeDelta::seconds(3));
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let strategy =
            BackoffStrategy::constant(TimeDelta::zero()).with_jitter(Jitter::Relative(0.5));

        assert_eq!(strategy.backoff(1), TimeDelta::zero());
    }
}
