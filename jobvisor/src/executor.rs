//! Pluggable job executors.
//!
//! Each job type is handled by a [`JobExecutor`]. Executors are collected in an
//! [`ExecutorRegistry`] and the engine dispatches each job to the first executor whose
//! [`JobExecutor::can_execute`] returns `true`.
use std::error::Error;

use async_trait::async_trait;
use tokio::{task::JoinError, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{execution::JobExecution, job::Job};

pub mod registry;

pub use registry::ExecutorRegistry;

/// Error type executors may return; it is turned into a failed [`ExecutionResult`].
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// The work for a single job type.
///
/// # Example
///
/// ```
/// # use jobvisor::prelude::*;
/// struct Cleanup;
///
/// #[async_trait::async_trait]
/// impl JobExecutor for Cleanup {
///     fn executor_type(&self) -> &str {
///         "cleanup"
///     }
///
///     async fn execute(
///         &self,
///         job: Job,
///         _execution: JobExecution,
///         deadline: Deadline,
///     ) -> Result<ExecutionResult, BoxError> {
///         let older_than = job.parameters.get("older_than_days").map(String::as_str);
///         if deadline.is_cancelled() {
///             return Ok(ExecutionResult::failure("stopped before starting"));
///         }
///         Ok(ExecutionResult::success(older_than.map(|days| format!("pruned {days} days"))))
///     }
/// }
/// ```
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// The job type this executor handles.
    fn executor_type(&self) -> &str;

    fn can_execute(&self, job: &Job) -> bool {
        job.job_type == self.executor_type()
    }

    /// Run a single attempt.
    ///
    /// Long running executors should watch the [`Deadline`]; an executor that ignores it is
    /// aborted by the engine once the attempt times out. Returning an `Err` is treated the same
    /// way as returning [`ExecutionResult::failure`].
    async fn execute(
        &self,
        job: Job,
        execution: JobExecution,
        deadline: Deadline,
    ) -> Result<ExecutionResult, BoxError>;
}

/// Signals when an attempt should stop, either because the attempt timed out or because the
/// whole execution was cancelled.
#[derive(Debug, Clone)]
pub struct Deadline {
    token: CancellationToken,
    expires_at: Instant,
}

impl Deadline {
    pub fn new(token: CancellationToken, expires_at: Instant) -> Self {
        Self { token, expires_at }
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn remaining(&self) -> std::time::Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the attempt should stop.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Why a run did not succeed.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum FailureKind {
    NotFound,
    NotExecutable,
    NoExecutorFound,
    ExecutorFailure,
    Timeout,
    Cancelled,
}

/// The outcome of an attempt, and of a whole execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    pub result_data: Option<String>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
    /// Set for every unsuccessful result.
    pub failure: Option<FailureKind>,
    /// The execution record this result belongs to, if one was created.
    pub execution_id: Option<crate::execution::ExecutionId>,
}

impl ExecutionResult {
    pub fn success(result_data: Option<String>) -> Self {
        Self {
            success: true,
            result_data,
            error_message: None,
            stack_trace: None,
            failure: None,
            execution_id: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::failed_with(FailureKind::ExecutorFailure, message)
    }

    pub(crate) fn failed_with(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            result_data: None,
            error_message: Some(message.into()),
            stack_trace: None,
            failure: Some(kind),
            execution_id: None,
        }
    }

    pub fn with_stack_trace(self, stack_trace: impl Into<String>) -> Self {
        Self {
            stack_trace: Some(stack_trace.into()),
            ..self
        }
    }

    pub(crate) fn for_execution(self, id: crate::execution::ExecutionId) -> Self {
        Self {
            execution_id: Some(id),
            ..self
        }
    }

    /// Unsuccessful results returned by an executor are always executor failures.
    pub(crate) fn normalised(self) -> Self {
        match self.success {
            true => Self {
                failure: None,
                ..self
            },
            false => Self {
                failure: Some(FailureKind::ExecutorFailure),
                error_message: self
                    .error_message
                    .or_else(|| Some("Job execution failed".to_owned())),
                ..self
            },
        }
    }
}

impl From<BoxError> for ExecutionResult {
    fn from(error: BoxError) -> Self {
        let mut trace = format!("{error:?}");
        let mut source = error.source();
        while let Some(cause) = source {
            trace.push_str(&format!("\ncaused by: {cause}"));
            source = cause.source();
        }
        Self::failure(error.to_string()).with_stack_trace(trace)
    }
}

impl From<JoinError> for ExecutionResult {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::failure(format!("Job executor panicked: {message}"))
            .with_stack_trace(format!("panic: {message}"))
    }
}
