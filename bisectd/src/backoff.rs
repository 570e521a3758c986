//! Backoff strategies for retrying forge calls.
//!
//! The forge client retries transient failures with a jittered exponential
//! backoff; the strategies here are kept separate so the retry schedule can
//! be asserted on in tests without going through HTTP.
//!
//! # Example
//!
//! ```
//! # use bisectd::backoff::{BackoffStrategy, Jitter};
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2))
//!     .with_max(TimeDelta::seconds(30))
//!     .with_jitter(Jitter::Relative(0.25));
//!
//! assert!(strategy.backoff(1) >= TimeDelta::milliseconds(1500));
//! assert!(strategy.backoff(1) <= TimeDelta::milliseconds(2500));
//! assert!(strategy.backoff(5) <= TimeDelta::milliseconds(37_500));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given a retry attempt as a number returns the [`TimeDelta`] to wait
    /// before the call should be retried.
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

/// Constant backoff strategy.
///
/// Always returns the same value no matter what the attempt is. Constructed
/// via [`BackoffStrategy::constant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u16) -> TimeDelta {
        self.delay
    }
}

/// Exponential backoff strategy.
///
/// Grows exponentially with each attempt; setting a maximum via
/// [`BackoffStrategy::with_max`] is advisable. Constructed via
/// [`BackoffStrategy::exponential`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut seconds = self
            .base
            .num_seconds()
            .checked_pow(attempt.into())
            .unwrap_or(i64::MAX);
        if let Some(max) = self.max {
            seconds = seconds.min(max.num_seconds());
        }
        TimeDelta::seconds(seconds)
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Added to the backoff in the range `-delta <= jitter <= delta`.
    Absolute(TimeDelta),
    /// Added as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        };
        if milliseconds == 0 {
            return value;
        }
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value + TimeDelta::milliseconds(jitter)
    }
}

/// A backoff strategy optionally modified by jitter and a lower bound.
///
/// All of the constructors and configuration functions are `const`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Constant> {
    /// Creates a [`BackoffStrategy`] with a constant backoff.
    ///
    /// # Example
    ///
    /// ```
    /// # use bisectd::backoff::BackoffStrategy;
    /// # use chrono::TimeDelta;
    /// let strategy = BackoffStrategy::constant(TimeDelta::seconds(10));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::seconds(10));
    /// assert_eq!(strategy.backoff(3), TimeDelta::seconds(10));
    /// ```
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    /// Creates a [`BackoffStrategy`] with an exponential backoff.
    ///
    /// # Example
    ///
    /// ```
    /// # use bisectd::backoff::BackoffStrategy;
    /// # use chrono::TimeDelta;
    /// let strategy =
    ///     BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(30));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
    /// assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
    /// assert_eq!(strategy.backoff(4), TimeDelta::seconds(16));
    /// assert_eq!(strategy.backoff(5), TimeDelta::seconds(30));
    /// ```
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`].
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Applies `jitter` to every returned backoff.
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Never returns a value below `min`, even after jitter.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }

    /// The delay to wait before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u16) -> TimeDelta {
        let backoff = self.strategy.backoff(attempt);
        match self.jitter {
            Some(jitter) => jitter.apply_jitter(backoff).max(self.min),
            None => backoff.max(self.min),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exponential_saturates_at_the_max() {
        let strategy =
            BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(8));
        assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
        assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
        assert_eq!(strategy.backoff(15), TimeDelta::seconds(8));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let strategy = BackoffStrategy::constant(TimeDelta::seconds(10))
            .with_jitter(Jitter::Absolute(TimeDelta::seconds(2)));
        for _ in 0..100 {
            let delay = strategy.backoff(1);
            assert!(delay >= TimeDelta::seconds(8));
            assert!(delay <= TimeDelta::seconds(12));
        }
    }

    #[test]
    fn min_clamps_after_jitter() {
        let strategy = BackoffStrategy::constant(TimeDelta::seconds(1))
            .with_jitter(Jitter::Relative(1.0))
            .with_min(TimeDelta::seconds(1));
        for _ in 0..100 {
            assert!(strategy.backoff(1) >= TimeDelta::seconds(1));
        }
    }
}
