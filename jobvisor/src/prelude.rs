//! The purpose of this module is to alleviate the need to import many of the `[jobvisor]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use jobvisor::prelude::*;
//! ```
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::clock::{Clock, SystemClock, TokioClock};
pub use crate::config::EngineConfig;
pub use crate::engine::{EngineError, JobEngine};
pub use crate::execution::{ExecutionId, ExecutionStatus, JobExecution};
pub use crate::executor::{
    BoxError, Deadline, ExecutionResult, ExecutorRegistry, FailureKind, JobExecutor,
};
pub use crate::job::{Job, JobBuilder, JobId, JobStatus, Parameters};
pub use crate::repository::{
    memory::InMemoryRepository, ExecutionRepository, JobRepository, RepositoryError,
};
pub use crate::scheduler::{SchedulerAdapter, SchedulerError};
pub use crate::trigger::{TokioTriggerMechanism, TriggerId, TriggerMechanism, TriggerOptions};
pub use tokio_util::sync::CancellationToken;
