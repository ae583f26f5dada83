//! The record of a single supervised run of a [`Job`](crate::job::Job).
//!
//! One [`JobExecution`] covers every retry attempt of a run. Its status follows the state
//! machine
//!
//! ```text
//! Scheduled -> Running -> { Succeeded | Failed | Retrying | Cancelled }
//! Retrying  -> Running | Failed | Cancelled
//! ```
//!
//! Succeeded, Failed and Cancelled are terminal; a terminal record cannot be changed.
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    executor::ExecutionResult,
    job::{JobId, Parameters},
};

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(i32);

impl From<i32> for ExecutionId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<ExecutionId> for i32 {
    fn from(value: ExecutionId) -> Self {
        value.0
    }
}

impl Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExecutionId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Scheduled,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid transition of {id} from {from:?} to {to:?}")]
pub struct TransitionError {
    pub id: ExecutionId,
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub status: ExecutionStatus,
    /// 1-based number of the current or last attempt.
    pub attempt_number: u32,
    /// The effective parameters of this run.
    pub parameters: Parameters,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_data: Option<String>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
    pub duration_ms: Option<i64>,
}

impl JobExecution {
    /// A new, not yet persisted, execution record.
    ///
    /// The id is assigned by [`crate::repository::ExecutionRepository::create`].
    pub fn new(job_id: JobId, parameters: Parameters, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id: ExecutionId::from(0),
            job_id,
            status: ExecutionStatus::Scheduled,
            attempt_number: 1,
            parameters,
            scheduled_at,
            started_at: None,
            completed_at: None,
            result_data: None,
            error_message: None,
            stack_trace: None,
            duration_ms: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, to: ExecutionStatus) -> Result<(), TransitionError> {
        use ExecutionStatus::*;
        let allowed = match (self.status, to) {
            (Scheduled | Retrying, Running) => true,
            (Running, Succeeded | Failed | Retrying | Cancelled) => true,
            (Retrying, Failed | Cancelled) => true,
            // A run can be rejected before its first attempt starts.
            (Scheduled, Failed | Cancelled) => true,
            _ => false,
        };
        if !allowed {
            return Err(TransitionError {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub(crate) fn mark_running(
        &mut self,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if attempt < self.attempt_number {
            return Err(TransitionError {
                id: self.id,
                from: self.status,
                to: ExecutionStatus::Running,
            });
        }
        self.transition(ExecutionStatus::Running)?;
        self.attempt_number = attempt;
        self.started_at.get_or_insert(now);
        Ok(())
    }

    pub(crate) fn mark_retrying(&mut self, result: &ExecutionResult) -> Result<(), TransitionError> {
        self.transition(ExecutionStatus::Retrying)?;
        self.error_message = result.error_message.clone();
        self.stack_trace = result.stack_trace.clone();
        Ok(())
    }

    pub(crate) fn mark_succeeded(
        &mut self,
        result: &ExecutionResult,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(ExecutionStatus::Succeeded)?;
        self.result_data = result.result_data.clone();
        self.error_message = None;
        self.stack_trace = None;
        self.complete(now);
        Ok(())
    }

    pub(crate) fn mark_failed(
        &mut self,
        result: &ExecutionResult,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(ExecutionStatus::Failed)?;
        self.error_message = result.error_message.clone();
        self.stack_trace = result.stack_trace.clone();
        self.complete(now);
        Ok(())
    }

    pub(crate) fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(ExecutionStatus::Cancelled)?;
        self.error_message = Some("Job execution was cancelled".to_owned());
        self.complete(now);
        Ok(())
    }

    fn complete(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|started_at| (now - started_at).num_milliseconds());
    }
}
