//! Binds job definitions to a [`TriggerMechanism`] and forwards fired triggers to the engine.
//!
//! Every registration is made with [`TriggerOptions::no_retry`]: the engine already retries
//! failed attempts according to the job's `retry_count`, so a failed run is only reported to the
//! trigger mechanism, never re-run by it.
//!
//! The adapter does not serialise triggers of the same job. A manual [`SchedulerAdapter::trigger_now`]
//! racing a cron firing runs the job twice concurrently.
use std::{sync::Arc, time::Duration};

use chrono::{FixedOffset, Offset, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    engine::JobEngine,
    job::{parse_cron, Job, JobError, JobId, JobStatus, Parameters},
    repository::{JobRepository, RepositoryError},
    trigger::{TriggerCallback, TriggerError, TriggerId, TriggerMechanism, TriggerOptions},
};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Job {0} has no cron expression")]
    NotRecurring(JobId),
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error(transparent)]
    InvalidCron(#[from] JobError),
    #[error("Error communicating with the repository")]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
}

pub struct SchedulerAdapter {
    engine: JobEngine,
    triggers: Arc<dyn TriggerMechanism>,
    jobs: Arc<dyn JobRepository>,
    timezone: FixedOffset,
    shutdown: CancellationToken,
}

impl SchedulerAdapter {
    pub fn new(
        engine: JobEngine,
        triggers: impl TriggerMechanism + 'static,
        jobs: Arc<dyn JobRepository>,
    ) -> Self {
        Self {
            engine,
            triggers: Arc::new(triggers),
            jobs,
            timezone: Utc.fix(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Evaluate cron expressions in `timezone` rather than UTC.
    pub fn with_timezone(self, timezone: FixedOffset) -> Self {
        Self { timezone, ..self }
    }

    pub fn engine(&self) -> &JobEngine {
        &self.engine
    }

    fn callback(&self, job_id: JobId, parameters: Parameters) -> TriggerCallback {
        let engine = self.engine.clone();
        let shutdown = self.shutdown.clone();
        Arc::new(move || {
            let engine = engine.clone();
            let parameters = parameters.clone();
            let cancellation = shutdown.child_token();
            Box::pin(async move {
                let result = engine
                    .execute_job(job_id, parameters, cancellation)
                    .await
                    .map_err(|source| TriggerError::Engine { job_id, source })?;
                match result.success {
                    true => Ok(()),
                    false => Err(TriggerError::JobFailed {
                        job_id,
                        message: result.error_message.unwrap_or_default(),
                    }),
                }
            })
        })
    }

    async fn load(&self, job_id: JobId) -> Result<Job, SchedulerError> {
        self.jobs
            .get_by_id(job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound(job_id))
    }

    /// Register the job's cron expression. Re-registering a job replaces its previous schedule.
    pub async fn schedule_recurring(&self, job: &Job) -> Result<TriggerId, SchedulerError> {
        let cron_expression = job
            .cron_expression
            .clone()
            .ok_or(SchedulerError::NotRecurring(job.id))?;
        parse_cron(&cron_expression)?;

        let id = TriggerId::recurring(job.id);
        self.triggers
            .add_or_update_recurring(
                id.clone(),
                self.callback(job.id, job.parameters.clone()),
                cron_expression,
                self.timezone,
                TriggerOptions::no_retry(),
            )
            .await?;
        tracing::debug!(job_id = %job.id, trigger_id = %id, "Scheduled recurring job {}", job.id);
        Ok(id)
    }

    pub async fn schedule_delayed(
        &self,
        job: &Job,
        delay: Duration,
    ) -> Result<TriggerId, SchedulerError> {
        let id = self
            .triggers
            .schedule(
                self.callback(job.id, job.parameters.clone()),
                delay,
                TriggerOptions::no_retry(),
            )
            .await?;
        tracing::debug!(job_id = %job.id, trigger_id = %id, ?delay, "Scheduled job {}", job.id);
        Ok(id)
    }

    /// Returns whether a registration existed. Removing twice is harmless.
    pub async fn remove_scheduled(&self, id: &TriggerId) -> bool {
        self.triggers.remove_if_exists(id).await
    }

    /// Run a job immediately, outside of its schedule.
    ///
    /// A job with a live recurring registration is fired through it and the recurring id is
    /// returned. Any other job is run through a one-shot trigger with no delay.
    pub async fn trigger_now(&self, job_id: JobId) -> Result<TriggerId, SchedulerError> {
        let job = self.load(job_id).await?;
        if job.is_recurring() {
            let id = TriggerId::recurring(job_id);
            if self.triggers.trigger(&id).await? {
                tracing::debug!(%job_id, trigger_id = %id, "Triggered job {job_id}");
                return Ok(id);
            }
        }
        self.schedule_delayed(&job, Duration::ZERO).await
    }

    /// Mark the job paused and stop its recurring schedule.
    pub async fn pause_job(&self, job_id: JobId) -> Result<(), SchedulerError> {
        let mut job = self.load(job_id).await?;
        job.status = JobStatus::Paused;
        self.jobs.update(&job).await?;
        self.unschedule_job(job_id).await;
        tracing::debug!(%job_id, "Paused job {job_id}");
        Ok(())
    }

    /// Mark the job active and re-register its schedule from its current cron expression.
    ///
    /// Returns the trigger id when the job is recurring.
    pub async fn resume_job(&self, job_id: JobId) -> Result<Option<TriggerId>, SchedulerError> {
        let mut job = self.load(job_id).await?;
        job.status = JobStatus::Active;
        self.jobs.update(&job).await?;
        tracing::debug!(%job_id, "Resumed job {job_id}");
        match job.is_recurring() {
            true => Ok(Some(self.schedule_recurring(&job).await?)),
            false => Ok(None),
        }
    }

    /// Remove the job's recurring registration. Must be called before the job is deleted.
    pub async fn unschedule_job(&self, job_id: JobId) -> bool {
        self.remove_scheduled(&TriggerId::recurring(job_id)).await
    }

    /// Register every active recurring job, typically on start up.
    ///
    /// Jobs whose schedule cannot be registered are logged and skipped.
    pub async fn sync_all(&self) -> Result<Vec<TriggerId>, SchedulerError> {
        let mut ids = vec![];
        for job in self.jobs.list().await? {
            if !job.is_executable() || !job.is_recurring() {
                continue;
            }
            match self.schedule_recurring(&job).await {
                Ok(id) => ids.push(id),
                Err(error) => tracing::error!(
                    job_id = %job.id,
                    ?error,
                    "Failed to schedule job {}: {error}",
                    job.id
                ),
            }
        }
        Ok(ids)
    }

    /// Cancel executions started by this adapter, close the engine and stop the trigger mechanism.
    pub async fn shutdown(&self) {
        tracing::debug!("Shutting down scheduler");
        self.shutdown.cancel();
        self.engine.close();
        self.triggers.graceful_shutdown().await;
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    use super::*;
    use crate::{
        clock::TokioClock,
        config::EngineConfig,
        execution::ExecutionStatus,
        executor::ExecutorRegistry,
        repository::{memory::InMemoryRepository, ExecutionRepository},
        testing::{ExecutorProbe, ScriptedExecutor, Step},
        trigger::{MockTriggerMechanism, TokioTriggerMechanism},
    };

    const EXECUTOR: &str = "scripted";

    struct Harness {
        repository: InMemoryRepository,
        triggers: TokioTriggerMechanism,
        scheduler: SchedulerAdapter,
        probe: ExecutorProbe,
    }

    fn harness(script: impl IntoIterator<Item = Step>) -> Harness {
        let anchor = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let repository = InMemoryRepository::new();
        let executor = ScriptedExecutor::new(EXECUTOR, script);
        let probe = executor.probe();
        let engine = JobEngine::new(
            EngineConfig::default(),
            repository.clone(),
            repository.clone(),
            ExecutorRegistry::new().with_executor(executor),
        )
        .with_clock(TokioClock::starting_at(anchor));
        let triggers = TokioTriggerMechanism::with_clock(TokioClock::starting_at(anchor));
        let scheduler =
            SchedulerAdapter::new(engine, triggers.clone(), Arc::new(repository.clone()));
        Harness {
            repository,
            triggers,
            scheduler,
            probe,
        }
    }

    impl Harness {
        async fn insert(&self, job: crate::job::JobBuilder) -> Job {
            let id = self.repository.insert(job.build().unwrap()).await.unwrap();
            JobRepository::get_by_id(&self.repository, id)
                .await
                .unwrap()
                .unwrap()
        }

        async fn statuses(&self, job_id: JobId) -> Vec<ExecutionStatus> {
            self.repository
                .list_for_job(job_id)
                .await
                .unwrap()
                .into_iter()
                .map(|execution| execution.status)
                .collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recurring_job_runs_through_the_engine() {
        let harness = harness([Step::succeed("ok")]);
        let job = harness
            .insert(Job::builder(EXECUTOR).with_cron("* * * * *"))
            .await;

        let id = harness.scheduler.schedule_recurring(&job).await.unwrap();
        assert_eq!(id, TriggerId::recurring(job.id));

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(
            harness.statuses(job.id).await,
            vec![ExecutionStatus::Succeeded, ExecutionStatus::Succeeded]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_is_not_retried_by_the_trigger_mechanism() {
        let harness = harness([Step::fail("boom")]);
        let job = harness
            .insert(
                Job::builder(EXECUTOR)
                    .with_cron("* * * * *")
                    .with_retry_count(1),
            )
            .await;

        harness.scheduler.schedule_recurring(&job).await.unwrap();
        tokio::time::sleep(Duration::from_secs(90)).await;

        assert_eq!(harness.probe.attempts(), 2);
        let executions = harness.repository.list_for_job(job.id).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Failed);
        assert_eq!(executions[0].attempt_number, 2);
    }

    #[tokio::test]
    async fn registrations_disable_trigger_retries() {
        let repository = InMemoryRepository::new();
        let job_id = repository
            .insert(Job::builder(EXECUTOR).with_cron("*/5 * * * *").build().unwrap())
            .await
            .unwrap();
        let job = JobRepository::get_by_id(&repository, job_id)
            .await
            .unwrap()
            .unwrap();

        let mut triggers = MockTriggerMechanism::new();
        triggers
            .expect_add_or_update_recurring()
            .withf(move |id, _, cron_expression, _, options| {
                *id == TriggerId::recurring(job_id)
                    && cron_expression == "*/5 * * * *"
                    && options.retry_attempts == 0
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        // Not registered with the mechanism, so the manual run falls back to a one-shot trigger.
        triggers
            .expect_trigger()
            .withf(move |id| *id == TriggerId::recurring(job_id))
            .times(1)
            .returning(|_| Ok(false));
        triggers
            .expect_schedule()
            .withf(|_, delay, options| *delay == Duration::ZERO && options.retry_attempts == 0)
            .times(1)
            .returning(|_, _, _| Ok(TriggerId::from("delayed-1")));

        let engine = JobEngine::new(
            EngineConfig::default(),
            repository.clone(),
            repository.clone(),
            ExecutorRegistry::new(),
        );
        let scheduler = SchedulerAdapter::new(engine, triggers, Arc::new(repository));

        scheduler.schedule_recurring(&job).await.unwrap();
        assert_eq!(
            scheduler.trigger_now(job_id).await.unwrap(),
            TriggerId::from("delayed-1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn one_off_job_cannot_be_scheduled_as_recurring() {
        let harness = harness([Step::succeed("ok")]);
        let job = harness.insert(Job::builder(EXECUTOR)).await;

        assert_matches!(
            harness.scheduler.schedule_recurring(&job).await,
            Err(SchedulerError::NotRecurring(id)) if id == job.id
        );
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_cron_is_rejected_before_registration() {
        let harness = harness([Step::succeed("ok")]);
        let mut job = harness.insert(Job::builder(EXECUTOR)).await;
        job.cron_expression = Some("sometimes".to_owned());

        assert_matches!(
            harness.scheduler.schedule_recurring(&job).await,
            Err(SchedulerError::InvalidCron(_))
        );
        assert!(harness.triggers.registrations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_runs_once_after_delay() {
        let harness = harness([Step::succeed("ok")]);
        let job = harness.insert(Job::builder(EXECUTOR)).await;

        let id = harness
            .scheduler
            .schedule_delayed(&job, Duration::from_secs(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(harness.statuses(job.id).await.is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            harness.statuses(job.id).await,
            vec![ExecutionStatus::Succeeded]
        );
        assert!(!harness.scheduler.remove_scheduled(&id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn removing_a_schedule_is_idempotent() {
        let harness = harness([Step::succeed("ok")]);
        let job = harness
            .insert(Job::builder(EXECUTOR).with_cron("* * * * *"))
            .await;
        let id = harness.scheduler.schedule_recurring(&job).await.unwrap();

        assert!(harness.scheduler.remove_scheduled(&id).await);
        assert!(!harness.scheduler.remove_scheduled(&id).await);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(harness.statuses(job.id).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_now_runs_immediately() {
        let harness = harness([Step::succeed("ok")]);
        let job = harness.insert(Job::builder(EXECUTOR)).await;

        harness.scheduler.trigger_now(job.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            harness.statuses(job.id).await,
            vec![ExecutionStatus::Succeeded]
        );
        assert_matches!(
            harness.scheduler.trigger_now(JobId::from(99)).await,
            Err(SchedulerError::JobNotFound(_))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_now_fires_the_recurring_registration() {
        let harness = harness([Step::succeed("ok")]);
        let job = harness
            .insert(Job::builder(EXECUTOR).with_cron("0 0 * * *"))
            .await;
        let id = harness.scheduler.schedule_recurring(&job).await.unwrap();

        assert_eq!(harness.scheduler.trigger_now(job.id).await.unwrap(), id);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            harness.statuses(job.id).await,
            vec![ExecutionStatus::Succeeded]
        );
        assert_eq!(harness.triggers.registrations(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_now_on_an_unregistered_recurring_job_runs_once() {
        let harness = harness([Step::succeed("ok")]);
        let job = harness
            .insert(Job::builder(EXECUTOR).with_cron("0 0 * * *"))
            .await;

        let id = harness.scheduler.trigger_now(job.id).await.unwrap();
        assert_ne!(id, TriggerId::recurring(job.id));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            harness.statuses(job.id).await,
            vec![ExecutionStatus::Succeeded]
        );
        assert!(harness.triggers.registrations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_rederive_the_schedule() {
        let harness = harness([Step::succeed("ok")]);
        let job = harness
            .insert(Job::builder(EXECUTOR).with_cron("* * * * *"))
            .await;
        let id = harness.scheduler.schedule_recurring(&job).await.unwrap();

        harness.scheduler.pause_job(job.id).await.unwrap();
        assert!(!harness.triggers.is_registered(&id));
        let paused = JobRepository::get_by_id(&harness.repository, job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paused.status, JobStatus::Paused);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(harness.statuses(job.id).await.is_empty());

        // The schedule changes while paused; resuming picks up the new one.
        let updated = Job {
            cron_expression: Some("0 0 * * *".to_owned()),
            ..paused
        };
        JobRepository::update(&harness.repository, &updated)
            .await
            .unwrap();

        assert_eq!(
            harness.scheduler.resume_job(job.id).await.unwrap(),
            Some(id.clone())
        );
        assert!(harness.triggers.is_registered(&id));
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(harness.statuses(job.id).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn paused_job_triggered_manually_is_rejected_by_the_engine() {
        let harness = harness([Step::succeed("ok")]);
        let job = harness.insert(Job::builder(EXECUTOR)).await;
        harness.scheduler.pause_job(job.id).await.unwrap();

        harness.scheduler.trigger_now(job.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(harness.statuses(job.id).await.is_empty());
        assert_eq!(harness.probe.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_all_registers_active_recurring_jobs() {
        let harness = harness([Step::succeed("ok")]);
        let active = harness
            .insert(Job::builder(EXECUTOR).with_cron("* * * * *"))
            .await;
        harness
            .insert(
                Job::builder(EXECUTOR)
                    .with_cron("* * * * *")
                    .with_status(JobStatus::Disabled),
            )
            .await;
        harness.insert(Job::builder(EXECUTOR)).await;

        let ids = harness.scheduler.sync_all().await.unwrap();

        assert_eq!(ids, vec![TriggerId::recurring(active.id)]);
        assert_eq!(harness.triggers.registrations(), ids);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_running_executions() {
        let harness = harness([Step::Hang]);
        let job = harness.insert(Job::builder(EXECUTOR)).await;

        harness.scheduler.trigger_now(job.id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(harness.statuses(job.id).await, vec![ExecutionStatus::Running]);

        harness.scheduler.shutdown().await;

        assert_eq!(
            harness.statuses(job.id).await,
            vec![ExecutionStatus::Cancelled]
        );
        assert_matches!(
            harness.scheduler.trigger_now(job.id).await,
            Err(SchedulerError::Trigger(TriggerError::ShutDown))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unscheduled_job_can_be_deleted() {
        let harness = harness([Step::succeed("ok")]);
        let job = harness
            .insert(Job::builder(EXECUTOR).with_cron("* * * * *"))
            .await;
        harness.scheduler.schedule_recurring(&job).await.unwrap();

        assert!(harness.scheduler.unschedule_job(job.id).await);
        assert!(harness.repository.delete(job.id).await.unwrap());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(harness.statuses(job.id).await.is_empty());
    }
}
