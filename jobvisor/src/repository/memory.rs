//! Provides an in memory implementation of [`JobRepository`] and [`ExecutionRepository`].
//!
//! It is not optimized, instead it is designed to be a correct implementation for use in tests
//! and for embedding the engine in processes without a database.
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ExecutionRepository, JobRepository, RepositoryError};
use crate::{
    execution::{ExecutionId, JobExecution},
    job::{Job, JobId},
};

/// An in memory store of jobs and executions.
///
/// Clones share the same underlying storage.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    jobs: Arc<RwLock<BTreeMap<JobId, Job>>>,
    executions: Arc<RwLock<BTreeMap<ExecutionId, JobExecution>>>,
    job_id_counter: Arc<AtomicI32>,
    execution_id_counter: Arc<AtomicI32>,
}

impl InMemoryRepository {
    /// Creates a new instance of [`InMemoryRepository`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of execution records ever created.
    pub fn execution_count(&self) -> Result<usize, RepositoryError> {
        Ok(self
            .executions
            .read()
            .map_err(|_| RepositoryError::BadState)?
            .len())
    }
}

#[async_trait]
impl JobRepository for InMemoryRepository {
    async fn get_by_id(&self, id: JobId) -> Result<Option<Job>, RepositoryError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| RepositoryError::BadState)?
            .get(&id)
            .cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().map_err(|_| RepositoryError::BadState)?;
        match jobs.get_mut(&job.id) {
            None => Err(RepositoryError::JobNotFound(job.id)),
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
        }
    }

    async fn touch_last_executed(
        &self,
        id: JobId,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().map_err(|_| RepositoryError::BadState)?;
        let job = jobs.get_mut(&id).ok_or(RepositoryError::JobNotFound(id))?;
        job.last_executed_at = Some(at);
        Ok(())
    }

    async fn insert(&self, job: Job) -> Result<JobId, RepositoryError> {
        let mut jobs = self.jobs.write().map_err(|_| RepositoryError::BadState)?;
        let id = JobId::from(self.job_id_counter.fetch_add(1, Ordering::SeqCst) + 1);
        jobs.insert(id, Job { id, ..job });
        Ok(id)
    }

    async fn delete(&self, id: JobId) -> Result<bool, RepositoryError> {
        Ok(self
            .jobs
            .write()
            .map_err(|_| RepositoryError::BadState)?
            .remove(&id)
            .is_some())
    }

    async fn list(&self) -> Result<Vec<Job>, RepositoryError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| RepositoryError::BadState)?
            .values()
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryRepository {
    async fn create(&self, execution: JobExecution) -> Result<JobExecution, RepositoryError> {
        let mut executions = self
            .executions
            .write()
            .map_err(|_| RepositoryError::BadState)?;
        let id = ExecutionId::from(self.execution_id_counter.fetch_add(1, Ordering::SeqCst) + 1);
        let execution = JobExecution { id, ..execution };
        executions.insert(id, execution.clone());
        Ok(execution)
    }

    async fn update(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        let mut executions = self
            .executions
            .write()
            .map_err(|_| RepositoryError::BadState)?;
        match executions.get_mut(&execution.id) {
            None => Err(RepositoryError::ExecutionNotFound(execution.id)),
            Some(stored) if stored.is_terminal() => {
                Err(RepositoryError::ExecutionFinalised(execution.id))
            }
            Some(stored) => {
                *stored = execution.clone();
                Ok(())
            }
        }
    }

    async fn get_by_id(&self, id: ExecutionId) -> Result<Option<JobExecution>, RepositoryError> {
        Ok(self
            .executions
            .read()
            .map_err(|_| RepositoryError::BadState)?
            .get(&id)
            .cloned())
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<JobExecution>, RepositoryError> {
        Ok(self
            .executions
            .read()
            .map_err(|_| RepositoryError::BadState)?
            .values()
            .filter(|execution| execution.job_id == job_id)
            .cloned()
            .collect())
    }
}
