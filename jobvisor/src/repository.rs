//! Persistence interfaces for jobs and their executions.
//!
//! The engine only needs single record reads and updates; implementations must be safe to call
//! concurrently. [`memory::InMemoryRepository`] implements both traits.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    execution::{ExecutionId, JobExecution},
    job::{Job, JobId},
};

pub mod memory;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_by_id(&self, id: JobId) -> Result<Option<Job>, RepositoryError>;
    async fn update(&self, job: &Job) -> Result<(), RepositoryError>;
    /// Set only `last_executed_at`, leaving every other field as currently stored.
    async fn touch_last_executed(
        &self,
        id: JobId,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
    /// Store a new job, returning its assigned id.
    async fn insert(&self, job: Job) -> Result<JobId, RepositoryError>;
    /// Remove a job. Returns whether it existed.
    ///
    /// Recurring jobs must be unscheduled first, see
    /// [`crate::scheduler::SchedulerAdapter::unschedule_job`].
    async fn delete(&self, id: JobId) -> Result<bool, RepositoryError>;
    async fn list(&self) -> Result<Vec<Job>, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Store a new execution, returning it with its assigned id.
    async fn create(&self, execution: JobExecution) -> Result<JobExecution, RepositoryError>;
    async fn update(&self, execution: &JobExecution) -> Result<(), RepositoryError>;
    async fn get_by_id(&self, id: ExecutionId) -> Result<Option<JobExecution>, RepositoryError>;
    /// All executions of a job, oldest first.
    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<JobExecution>, RepositoryError>;
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),
    #[error("Execution {0} has finished and can no longer be updated")]
    ExecutionFinalised(ExecutionId),
    #[error("System in bad state")]
    BadState,
}
