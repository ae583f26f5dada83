//! Helpers for testing code built on the engine.
//!
//! [`ScriptedExecutor`] plays back a fixed sequence of attempt outcomes and records when each
//! attempt started, so retry, timeout and concurrency behaviour can be asserted on. Combine it
//! with `#[tokio::test(start_paused = true)]` and [`crate::clock::TokioClock`] to make timing
//! assertions deterministic.
//!
//! # Example
//!
//! ```
//! # use jobvisor::prelude::*;
//! use jobvisor::testing::{ScriptedExecutor, Step};
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let executor = ScriptedExecutor::new("flaky", [Step::fail("boom"), Step::succeed("ok")]);
//! let probe = executor.probe();
//! let repository = InMemoryRepository::new();
//! let engine = JobEngine::new(
//!     EngineConfig::default().with_backoff(0, None),
//!     repository.clone(),
//!     repository.clone(),
//!     ExecutorRegistry::new().with_executor(executor),
//! );
//!
//! let job_id = repository
//!     .insert(Job::builder("flaky").with_retry_count(1).build().unwrap())
//!     .await
//!     .unwrap();
//! let result = engine
//!     .execute_job(job_id, Parameters::new(), CancellationToken::new())
//!     .await
//!     .unwrap();
//!
//! assert!(result.success);
//! assert_eq!(probe.attempts(), 2);
//! # });
//! ```
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    execution::JobExecution,
    executor::{BoxError, Deadline, ExecutionResult, JobExecutor},
    job::Job,
};

/// The behaviour of a single scripted attempt.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return a successful result with the given data.
    Succeed(Option<String>),
    /// Return an unsuccessful result.
    Fail(String),
    /// Return an `Err`.
    Error(String),
    /// Panic inside the executor.
    Panic(String),
    /// Sleep, ignoring the deadline, then succeed.
    Sleep(Duration),
    /// Never complete and ignore the deadline.
    Hang,
    /// Wait until the deadline fires, then report failure.
    AwaitDeadline,
}

impl Step {
    pub fn succeed(data: impl Into<String>) -> Self {
        Self::Succeed(Some(data.into()))
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(message.into())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct ScriptedError(String);

/// An executor which plays back a script of [`Step`]s, one per attempt.
///
/// Once the script is exhausted the last step is repeated.
#[derive(Clone)]
pub struct ScriptedExecutor {
    executor_type: String,
    script: Arc<Vec<Step>>,
    probe: ExecutorProbe,
}

impl ScriptedExecutor {
    pub fn new(executor_type: impl Into<String>, script: impl IntoIterator<Item = Step>) -> Self {
        Self {
            executor_type: executor_type.into(),
            script: Arc::new(script.into_iter().collect()),
            probe: Default::default(),
        }
    }

    /// A handle for observing the attempts made against this executor.
    pub fn probe(&self) -> ExecutorProbe {
        self.probe.clone()
    }

    fn step(&self, call: usize) -> Step {
        self.script
            .get(call)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or(Step::Succeed(None))
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    fn executor_type(&self) -> &str {
        &self.executor_type
    }

    async fn execute(
        &self,
        _job: Job,
        _execution: JobExecution,
        deadline: Deadline,
    ) -> Result<ExecutionResult, BoxError> {
        let (call, _running) = self.probe.start();
        match self.step(call) {
            Step::Succeed(data) => Ok(ExecutionResult::success(data)),
            Step::Fail(message) => Ok(ExecutionResult::failure(message)),
            Step::Error(message) => Err(Box::new(ScriptedError(message))),
            Step::Panic(message) => panic!("{message}"),
            Step::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(ExecutionResult::success(None))
            }
            Step::Hang => {
                std::future::pending::<()>().await;
                Ok(ExecutionResult::success(None))
            }
            Step::AwaitDeadline => {
                deadline.cancelled().await;
                Ok(ExecutionResult::failure("stopped at deadline"))
            }
        }
    }
}

/// Observes attempts made against a [`ScriptedExecutor`].
#[derive(Clone, Default)]
pub struct ExecutorProbe {
    inner: Arc<ProbeState>,
}

#[derive(Default)]
struct ProbeState {
    starts: Mutex<Vec<Instant>>,
    finishes: Mutex<Vec<Instant>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

struct RunningGuard(Arc<ProbeState>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
        if let Ok(mut finishes) = self.0.finishes.lock() {
            finishes.push(Instant::now());
        }
    }
}

impl ExecutorProbe {
    fn start(&self) -> (usize, RunningGuard) {
        let call = match self.inner.starts.lock() {
            Ok(mut starts) => {
                starts.push(Instant::now());
                starts.len() - 1
            }
            Err(_) => 0,
        };
        let running = self.inner.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_running.fetch_max(running, Ordering::SeqCst);
        (call, RunningGuard(self.inner.clone()))
    }

    /// The number of attempts started.
    pub fn attempts(&self) -> usize {
        self.started_at().len()
    }

    /// When each attempt started, in order.
    pub fn started_at(&self) -> Vec<Instant> {
        self.inner
            .starts
            .lock()
            .map(|starts| starts.clone())
            .unwrap_or_default()
    }

    /// When each attempt finished or was aborted, in order of finishing.
    pub fn finished_at(&self) -> Vec<Instant> {
        self.inner
            .finishes
            .lock()
            .map(|finishes| finishes.clone())
            .unwrap_or_default()
    }

    /// The number of attempts currently in progress.
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// The largest number of attempts that were in progress at the same time.
    pub fn max_running(&self) -> usize {
        self.inner.max_running.load(Ordering::SeqCst)
    }
}
