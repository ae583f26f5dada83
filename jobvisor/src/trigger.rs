//! The interface to the mechanism that fires job triggers.
//!
//! A trigger mechanism calls back into the engine on a cron schedule or after a delay. It may
//! have its own retry for failed callbacks; the [`crate::scheduler::SchedulerAdapter`] always
//! registers with [`TriggerOptions::no_retry`] because retries belong to the engine.
//!
//! [`runner::TokioTriggerMechanism`] is an in-process implementation.
use std::{fmt::Display, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::FixedOffset;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::{
    engine::EngineError,
    job::{JobError, JobId},
};

pub mod runner;

pub use runner::TokioTriggerMechanism;

pub type TriggerFuture = BoxFuture<'static, Result<(), TriggerError>>;

/// Invoked every time a trigger fires.
pub type TriggerCallback = Arc<dyn Fn() -> TriggerFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggerId(String);

impl TriggerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The stable id of a job's recurring registration.
    pub fn recurring(job_id: JobId) -> Self {
        Self(format!("job-{}", i32::from(job_id)))
    }
}

impl From<String> for TriggerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TriggerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for TriggerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the trigger mechanism treats a failed callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerOptions {
    /// Additional invocations of the callback after it fails.
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl TriggerOptions {
    /// Failed callbacks are reported and never re-run.
    pub const fn no_retry() -> Self {
        Self {
            retry_attempts: 0,
            retry_delay: Duration::ZERO,
        }
    }
}

impl Default for TriggerOptions {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Job {job_id} failed: {message}")]
    JobFailed { job_id: JobId, message: String },
    #[error("Job {job_id} could not be executed")]
    Engine {
        job_id: JobId,
        #[source]
        source: EngineError,
    },
    #[error(transparent)]
    InvalidSchedule(#[from] JobError),
    #[error("The trigger mechanism has been shut down")]
    ShutDown,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TriggerMechanism: Send + Sync {
    /// Register, or replace, a recurring trigger.
    async fn add_or_update_recurring(
        &self,
        id: TriggerId,
        callback: TriggerCallback,
        cron_expression: String,
        timezone: FixedOffset,
        options: TriggerOptions,
    ) -> Result<(), TriggerError>;

    /// Remove a registration. Returns whether it existed.
    async fn remove_if_exists(&self, id: &TriggerId) -> bool;

    /// Fire a recurring registration now, out of band. Returns whether it existed.
    async fn trigger(&self, id: &TriggerId) -> Result<bool, TriggerError>;

    /// Fire a callback once after `delay`.
    async fn schedule(
        &self,
        callback: TriggerCallback,
        delay: Duration,
        options: TriggerOptions,
    ) -> Result<TriggerId, TriggerError>;

    /// Stop firing triggers and wait for callbacks in flight to finish.
    async fn graceful_shutdown(&self);
}
