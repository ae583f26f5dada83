//! Supervised execution of scheduled jobs.
//!
//! A [`job::Job`] names a job type, an optional cron schedule, parameters and a retry and timeout
//! policy. The [`engine::JobEngine`] runs jobs by dispatching them to a registered
//! [`executor::JobExecutor`], bounding the number of concurrent executions, applying per-attempt
//! timeouts and retrying failures with exponential backoff. Every run is recorded as an
//! [`execution::JobExecution`] in an [`repository::ExecutionRepository`].
//!
//! The [`scheduler::SchedulerAdapter`] connects jobs to a [`trigger::TriggerMechanism`] so that
//! recurring jobs fire on their cron schedule and one-off runs can be requested at any time.
//!
//! # Example
//!
//! ```
//! use std::{sync::Arc, time::Duration};
//!
//! use jobvisor::prelude::*;
//!
//! struct Report;
//!
//! #[async_trait::async_trait]
//! impl JobExecutor for Report {
//!     fn executor_type(&self) -> &str {
//!         "report"
//!     }
//!
//!     async fn execute(
//!         &self,
//!         job: Job,
//!         _execution: JobExecution,
//!         _deadline: Deadline,
//!     ) -> Result<ExecutionResult, BoxError> {
//!         Ok(ExecutionResult::success(Some(format!("report for {}", job.name))))
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let repository = InMemoryRepository::new();
//! let engine = JobEngine::new(
//!     EngineConfig::default(),
//!     repository.clone(),
//!     repository.clone(),
//!     ExecutorRegistry::new().with_executor(Report),
//! );
//! let scheduler = SchedulerAdapter::new(
//!     engine,
//!     TokioTriggerMechanism::new(),
//!     Arc::new(repository.clone()),
//! );
//!
//! let job_id = repository
//!     .insert(
//!         Job::builder("report")
//!             .with_name("nightly")
//!             .with_cron("0 2 * * *")
//!             .build()
//!             .unwrap(),
//!     )
//!     .await
//!     .unwrap();
//!
//! scheduler.sync_all().await.unwrap();
//! scheduler.trigger_now(job_id).await.unwrap();
//! # tokio::time::sleep(Duration::from_millis(50)).await;
//! scheduler.shutdown().await;
//! # });
//! ```
pub mod backoff;
pub mod clock;
pub mod config;
pub mod engine;
pub mod execution;
pub mod executor;
pub mod job;
pub mod prelude;
pub mod repository;
pub mod scheduler;
pub mod testing;
pub mod trigger;

pub use engine::{EngineError, JobEngine};
pub use scheduler::{SchedulerAdapter, SchedulerError};
