//! Engine configuration.
use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;

use crate::{
    backoff::{BackoffStrategy, Exponential},
    job::DEFAULT_TIMEOUT,
};

/// Configuration for a [`crate::engine::JobEngine`].
///
/// Every field has a default so partial configuration can be deserialized:
///
/// ```
/// # use jobvisor::config::EngineConfig;
/// let config = EngineConfig::default().with_max_concurrent_jobs(4);
///
/// assert_eq!(config.max_concurrent_jobs, 4);
/// assert_eq!(config.default_timeout().as_secs(), 300);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bound on executions in flight across all jobs.
    pub max_concurrent_jobs: usize,
    /// Used for jobs whose `timeout_seconds` is zero.
    pub default_timeout_seconds: u64,
    /// Delay before the second attempt; doubled for every attempt after that.
    pub backoff_initial_seconds: i64,
    pub backoff_max_seconds: Option<i64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            default_timeout_seconds: DEFAULT_TIMEOUT.as_secs(),
            backoff_initial_seconds: 1,
            backoff_max_seconds: None,
        }
    }
}

impl EngineConfig {
    pub const fn with_max_concurrent_jobs(mut self, max_concurrent_jobs: usize) -> Self {
        self.max_concurrent_jobs = max_concurrent_jobs;
        self
    }

    pub const fn with_default_timeout_seconds(mut self, seconds: u64) -> Self {
        self.default_timeout_seconds = seconds;
        self
    }

    pub const fn with_backoff(mut self, initial_seconds: i64, max_seconds: Option<i64>) -> Self {
        self.backoff_initial_seconds = initial_seconds;
        self.backoff_max_seconds = max_seconds;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        match self.default_timeout_seconds {
            0 => DEFAULT_TIMEOUT,
            seconds => Duration::from_secs(seconds),
        }
    }

    pub fn backoff_strategy(&self) -> BackoffStrategy<Exponential> {
        let strategy =
            BackoffStrategy::exponential(TimeDelta::seconds(self.backoff_initial_seconds.max(0)));
        match self.backoff_max_seconds {
            Some(max) => strategy.with_max(TimeDelta::seconds(max.max(0))),
            None => strategy,
        }
    }
}
