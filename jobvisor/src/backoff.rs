//! Delays between the retry attempts of one execution.
//!
//! After attempt `n` fails and attempts remain, the engine sleeps for `backoff(n)` before
//! starting attempt `n + 1`. The engine default doubles from one second, so a job with
//! `retry_count = 3` waits 1s, 2s and then 4s between its four attempts.
//!
//! ```
//! # use jobvisor::prelude::*;
//! # use chrono::TimeDelta;
//! let retries = BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(5));
//!
//! let delays: Vec<_> = (1..=4).map(|attempt| retries.backoff(attempt).num_seconds()).collect();
//! assert_eq!(delays, [2, 4, 5, 5]);
//! ```
use chrono::TimeDelta;
use rand::Rng;

/// Computes the delay to wait after a failed attempt.
pub trait Strategy {
    /// `attempt` is the 1-based number of the attempt that just failed.
    fn backoff(&self, attempt: u32) -> TimeDelta;
}

/// The same delay after every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant(TimeDelta);

impl Strategy for Constant {
    fn backoff(&self, _: u32) -> TimeDelta {
        self.0
    }
}

/// `initial * 2^(attempt - 1)`, saturating at [`TimeDelta::MAX`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential(TimeDelta);

impl Strategy for Exponential {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let doublings = attempt.saturating_sub(1);
        2_i32
            .checked_pow(doublings)
            .and_then(|factor| self.0.checked_mul(factor))
            .unwrap_or(TimeDelta::MAX)
    }
}

/// Randomness added to a delay so that jobs failing together do not retry in lockstep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Up to this much earlier or later.
    Absolute(TimeDelta),
    /// Up to this fraction of the delay earlier or later.
    Relative(f64),
}

impl Jitter {
    fn spread(self, delay: TimeDelta) -> i64 {
        match self {
            Self::Absolute(spread) => spread.num_milliseconds().abs(),
            Self::Relative(fraction) => {
                (delay.num_milliseconds() as f64 * fraction.abs()).round() as i64
            }
        }
    }

    fn apply(self, delay: TimeDelta) -> TimeDelta {
        let spread = self.spread(delay);
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        delay
            .checked_add(&TimeDelta::milliseconds(offset))
            .unwrap_or(delay)
    }
}

/// A [`Strategy`] bounded below and optionally above, with optional [`Jitter`].
///
/// Bounds apply after the jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
    max: Option<TimeDelta>,
}

impl BackoffStrategy<Constant> {
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::bounded(Constant(delay))
    }
}

impl BackoffStrategy<Exponential> {
    pub const fn exponential(initial: TimeDelta) -> Self {
        Self::bounded(Exponential(initial))
    }
}

impl<T: Strategy> BackoffStrategy<T> {
    const fn bounded(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
            max: None,
        }
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }

    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.max = Some(max);
        self
    }
}

impl<T: Strategy> Strategy for BackoffStrategy<T> {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let delay = self.strategy.backoff(attempt);
        let delay = self.jitter.map_or(delay, |jitter| jitter.apply(delay));
        let delay = self.max.map_or(delay, |max| delay.min(max));
        delay.max(self.min)
    }
}

/// The engine's default: 1s, 2s, 4s, 8s, ...
pub const DEFAULT_BACKOFF_STRATEGY: BackoffStrategy<Exponential> =
    BackoffStrategy::exponential(TimeDelta::seconds(1));
