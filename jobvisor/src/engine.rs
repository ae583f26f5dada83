//! The execution engine.
//!
//! [`JobEngine::execute_job`] turns a job id into a supervised run: it waits for a slot in the
//! engine's concurrency limit, checks the job can run, records a [`JobExecution`] and then runs
//! the attempt loop, retrying failed attempts with backoff until the job succeeds, runs out of
//! attempts or the caller cancels.
//!
//! Two different things can stop an attempt early and they are kept apart:
//!
//! - the caller's [`CancellationToken`] stops the whole execution, including any pending backoff,
//!   and leaves it `Cancelled`;
//! - the per-attempt timeout only stops the current attempt, which then counts as a failure and
//!   may be retried.
//!
//! The engine does not serialise executions of the same job: two concurrent calls for one job id
//! both run. Callers that need at most one run per job must serialise their triggers.
use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{sync::Semaphore, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::{
    backoff::Strategy,
    clock::{Clock, SystemClock},
    config::EngineConfig,
    execution::{JobExecution, TransitionError},
    executor::{Deadline, ExecutionResult, ExecutorRegistry, FailureKind, JobExecutor},
    job::{Job, JobId, Parameters},
    repository::{ExecutionRepository, JobRepository, RepositoryError},
};

/// How long an interrupted executor has to return after its [`Deadline`] fires.
pub const DEADLINE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Error communicating with the repository")]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("The engine is closed and no longer accepts executions")]
    Closed,
}

/// Why an attempt stopped before the executor returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    CallerCancelled,
    TimedOut(Duration),
}

#[derive(Debug)]
enum AttemptOutcome {
    Completed(ExecutionResult),
    Interrupted(Interruption),
}

/// Runs jobs under a global concurrency limit with retries and timeouts.
///
/// Cloning is cheap and clones share the same concurrency limit.
#[derive(Clone)]
pub struct JobEngine {
    jobs: Arc<dyn JobRepository>,
    executions: Arc<dyn ExecutionRepository>,
    registry: ExecutorRegistry,
    permits: Arc<Semaphore>,
    max_concurrent_jobs: usize,
    default_timeout: Duration,
    backoff: Arc<dyn Strategy + Send + Sync>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for JobEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEngine")
            .field("registry", &self.registry)
            .field("max_concurrent_jobs", &self.max_concurrent_jobs)
            .field("available_slots", &self.available_slots())
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl JobEngine {
    pub fn new(
        config: EngineConfig,
        jobs: impl JobRepository + 'static,
        executions: impl ExecutionRepository + 'static,
        registry: ExecutorRegistry,
    ) -> Self {
        Self::from_shared(config, Arc::new(jobs), Arc::new(executions), registry)
    }

    pub fn from_shared(
        config: EngineConfig,
        jobs: Arc<dyn JobRepository>,
        executions: Arc<dyn ExecutionRepository>,
        registry: ExecutorRegistry,
    ) -> Self {
        let max_concurrent_jobs = match config.max_concurrent_jobs {
            0 => {
                tracing::warn!("max_concurrent_jobs of 0 would block every job, using 1");
                1
            }
            max => max,
        };
        Self {
            jobs,
            executions,
            registry,
            permits: Arc::new(Semaphore::new(max_concurrent_jobs)),
            max_concurrent_jobs,
            default_timeout: config.default_timeout(),
            backoff: Arc::new(config.backoff_strategy()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the backoff strategy derived from the [`EngineConfig`].
    pub fn with_backoff(self, backoff: impl Strategy + Send + Sync + 'static) -> Self {
        Self {
            backoff: Arc::new(backoff),
            ..self
        }
    }

    pub fn with_clock(self, clock: impl Clock + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
            ..self
        }
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs
    }

    /// The number of executions that could be admitted right now.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stop admitting executions. Executions already admitted run to completion; callers waiting
    /// for a slot get [`EngineError::Closed`].
    pub fn close(&self) {
        tracing::debug!("Closing job engine");
        self.permits.close();
    }

    /// Run a job to completion, including all of its retries.
    ///
    /// Every failure of the job itself (missing job, paused job, missing executor, executor
    /// errors, timeouts and cancellation) is reported through the returned [`ExecutionResult`].
    /// Only failures to persist state are returned as errors.
    #[instrument(skip(self, parameters, cancellation), fields(execution_id = tracing::field::Empty))]
    pub async fn execute_job(
        &self,
        job_id: JobId,
        parameters: Parameters,
        cancellation: CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        // Held until this function returns, on every path.
        let _permit = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                tracing::debug!(%job_id, "Job {job_id} cancelled while waiting for a slot");
                return Ok(ExecutionResult::failed_with(
                    FailureKind::Cancelled,
                    "Job execution was cancelled before it started",
                ));
            }
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| EngineError::Closed)?
            }
        };

        let Some(job) = self.jobs.get_by_id(job_id).await? else {
            tracing::warn!(%job_id, "Job {job_id} not found");
            return Ok(ExecutionResult::failed_with(
                FailureKind::NotFound,
                format!("Job {job_id} not found"),
            ));
        };
        if !job.is_executable() {
            tracing::warn!(%job_id, status = ?job.status, "Job {job_id} is not executable");
            return Ok(ExecutionResult::failed_with(
                FailureKind::NotExecutable,
                format!("Job {job_id} is {:?} and cannot be executed", job.status),
            ));
        }

        let parameters = job.merged_parameters(parameters);
        let execution = self
            .executions
            .create(JobExecution::new(job.id, parameters, self.clock.now()))
            .await?;
        tracing::Span::current().record("execution_id", tracing::field::display(execution.id));
        tracing::debug!(%job_id, execution_id = %execution.id, "Executing job {job_id}");

        let result = self.supervise(&job, execution, &cancellation).await?;
        self.record_last_executed(job_id).await?;
        Ok(result)
    }

    async fn supervise(
        &self,
        job: &Job,
        mut execution: JobExecution,
        cancellation: &CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        let job_id = job.id;
        let timeout = job.effective_timeout(self.default_timeout);
        let max_attempts = job.max_attempts();
        let mut attempt = 1;

        loop {
            if cancellation.is_cancelled() {
                return self.cancel(execution).await;
            }
            execution.mark_running(attempt, self.clock.now())?;
            self.executions.update(&execution).await?;

            let Some(executor) = self.registry.resolve(job) else {
                let result = ExecutionResult::failed_with(
                    FailureKind::NoExecutorFound,
                    format!("No executor found for job type '{}'", job.job_type),
                );
                return self.fail(execution, result).await;
            };

            let result = match self
                .attempt(executor, job, &execution, timeout, cancellation)
                .await
            {
                AttemptOutcome::Completed(result) => result,
                AttemptOutcome::Interrupted(Interruption::CallerCancelled) => {
                    return self.cancel(execution).await
                }
                AttemptOutcome::Interrupted(Interruption::TimedOut(timeout)) => {
                    ExecutionResult::failed_with(
                        FailureKind::Timeout,
                        format!(
                            "Job execution timed out after {} seconds",
                            timeout.as_secs()
                        ),
                    )
                }
            };

            if result.success {
                return self.succeed(execution, result).await;
            }
            if attempt >= max_attempts {
                return self.fail(execution, result).await;
            }

            let delay = self.backoff.backoff(attempt);
            tracing::warn!(
                %job_id,
                attempt,
                error = ?result.error_message,
                "Job {job_id} attempt {attempt} failed and will be retried in {delay}",
            );
            execution.mark_retrying(&result)?;
            self.executions.update(&execution).await?;

            tokio::select! {
                biased;
                _ = cancellation.cancelled() => return self.cancel(execution).await,
                _ = tokio::time::sleep(delay.to_std().unwrap_or(Duration::ZERO)) => {}
            }
            attempt += 1;
        }
    }

    /// Run one attempt in its own task so that panics are contained and an executor that ignores
    /// its deadline can be aborted.
    async fn attempt(
        &self,
        executor: Arc<dyn JobExecutor>,
        job: &Job,
        execution: &JobExecution,
        timeout: Duration,
        cancellation: &CancellationToken,
    ) -> AttemptOutcome {
        let token = cancellation.child_token();
        let deadline = Deadline::new(token.clone(), Instant::now() + timeout);
        let mut handle = tokio::spawn({
            let job = job.clone();
            let execution = execution.clone();
            async move { executor.execute(job, execution, deadline).await }.in_current_span()
        });

        let interruption = tokio::select! {
            biased;
            _ = cancellation.cancelled() => Interruption::CallerCancelled,
            joined = &mut handle => return AttemptOutcome::Completed(match joined {
                Ok(Ok(result)) => result.normalised(),
                Ok(Err(error)) => error.into(),
                Err(error) => error.into(),
            }),
            _ = tokio::time::sleep(timeout) => Interruption::TimedOut(timeout),
        };

        // Let a cooperative executor observe its deadline before it is aborted. Whatever it
        // returns now, the attempt is recorded as interrupted.
        token.cancel();
        if tokio::time::timeout(DEADLINE_GRACE, &mut handle).await.is_err() {
            tracing::warn!(
                job_id = %job.id,
                "Executor for job {} ignored its deadline and was aborted",
                job.id
            );
            handle.abort();
        }
        AttemptOutcome::Interrupted(interruption)
    }

    async fn succeed(
        &self,
        mut execution: JobExecution,
        result: ExecutionResult,
    ) -> Result<ExecutionResult, EngineError> {
        execution.mark_succeeded(&result, self.clock.now())?;
        self.executions.update(&execution).await?;
        tracing::debug!(
            job_id = %execution.job_id,
            attempt = execution.attempt_number,
            duration_ms = execution.duration_ms,
            "Job {} succeeded",
            execution.job_id
        );
        Ok(result.for_execution(execution.id))
    }

    async fn fail(
        &self,
        mut execution: JobExecution,
        result: ExecutionResult,
    ) -> Result<ExecutionResult, EngineError> {
        execution.mark_failed(&result, self.clock.now())?;
        self.executions.update(&execution).await?;
        tracing::error!(
            job_id = %execution.job_id,
            attempt = execution.attempt_number,
            failure = ?result.failure,
            "Job {} failed and will not be retried: {}",
            execution.job_id,
            result.error_message.as_deref().unwrap_or_default()
        );
        Ok(result.for_execution(execution.id))
    }

    async fn cancel(&self, mut execution: JobExecution) -> Result<ExecutionResult, EngineError> {
        execution.mark_cancelled(self.clock.now())?;
        self.executions.update(&execution).await?;
        tracing::warn!(
            job_id = %execution.job_id,
            attempt = execution.attempt_number,
            "Job {} cancelled",
            execution.job_id
        );
        Ok(
            ExecutionResult::failed_with(FailureKind::Cancelled, "Job execution was cancelled")
                .for_execution(execution.id),
        )
    }

    /// Only `last_executed_at` is written, so a pause made while the job ran is kept.
    async fn record_last_executed(&self, job_id: JobId) -> Result<(), EngineError> {
        match self.jobs.touch_last_executed(job_id, self.clock.now()).await {
            Ok(()) => Ok(()),
            Err(RepositoryError::JobNotFound(_)) => {
                tracing::warn!(%job_id, "Job {job_id} was deleted while executing");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }
}
