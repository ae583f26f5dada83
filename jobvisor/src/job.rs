//! Job definitions.
//!
//! A [`Job`] is the static description of a unit of work: which executor runs it, how often it
//! recurs, how many times it may be retried and how long each attempt may take. The runtime
//! record of running a job lives in [`crate::execution::JobExecution`].
use std::{collections::BTreeMap, fmt::Display, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod builder;

pub use builder::JobBuilder;

/// Flat string keyed parameters passed to an executor.
pub type Parameters = BTreeMap<String, String>;

/// The default per-attempt timeout used when a job does not specify one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(i32);

impl From<i32> for JobId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<JobId> for i32 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Whether new triggers for a job are honoured.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
pub enum JobStatus {
    #[default]
    Active,
    Paused,
    Disabled,
}

/// The definition of a recurring or ad hoc unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    /// Key used to select the [`crate::executor::JobExecutor`] for this job.
    pub job_type: String,
    /// When present the job is scheduled as a recurring job.
    pub cron_expression: Option<String>,
    pub parameters: Parameters,
    /// The number of additional attempts after the first failure.
    pub retry_count: u32,
    /// Per-attempt wall clock budget. Zero means [`DEFAULT_TIMEOUT`] (or the engine's configured
    /// default).
    pub timeout_seconds: u32,
    pub status: JobStatus,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Start building a new job for the given executor type.
    pub fn builder(job_type: impl Into<String>) -> JobBuilder {
        JobBuilder::new(job_type)
    }

    /// Only active jobs may be executed.
    pub fn is_executable(&self) -> bool {
        self.status == JobStatus::Active
    }

    pub fn is_recurring(&self) -> bool {
        self.cron_expression.is_some()
    }

    /// The maximum number of attempts for a single execution.
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    pub fn effective_timeout(&self, default: Duration) -> Duration {
        match self.timeout_seconds {
            0 => default,
            seconds => Duration::from_secs(seconds.into()),
        }
    }

    /// The job's own parameters overlaid with the invocation overrides.
    ///
    /// On a key collision the override wins.
    pub fn merged_parameters(&self, overrides: Parameters) -> Parameters {
        let mut parameters = self.parameters.clone();
        parameters.extend(overrides);
        parameters
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
    #[error("A job type must be provided")]
    MissingJobType,
}

/// Parse a cron expression, accepting both the classic five field form and the six/seven field
/// form with seconds.
///
/// A five field expression fires at second zero of the matching minute.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, JobError> {
    use std::str::FromStr;

    let normalised = match expression.split_whitespace().count() {
        5 => format!("0 {expression}"),
        _ => expression.to_owned(),
    };
    cron::Schedule::from_str(&normalised).map_err(|err| JobError::InvalidCron {
        expression: expression.to_owned(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod test {
    use assert_matches::assert_matches;

    use super::*;

    impl Job {
        pub(crate) fn mock_job() -> Self {
            Job::builder("test_executor")
                .with_name("mock job")
                .build()
                .expect("mock job is valid")
        }

        pub(crate) fn with_id(self, id: impl Into<JobId>) -> Self {
            Self {
                id: id.into(),
                ..self
            }
        }

        pub(crate) fn with_status(self, status: JobStatus) -> Self {
            Self { status, ..self }
        }
    }

    #[test]
    fn invocation_parameters_win_on_collision() {
        let job = Job::builder("report")
            .with_parameter("format", "pdf")
            .with_parameter("region", "eu")
            .build()
            .unwrap();

        let merged = job.merged_parameters(Parameters::from([
            ("format".to_owned(), "csv".to_owned()),
            ("requested_by".to_owned(), "admin".to_owned()),
        ]));

        assert_eq!(merged.get("format").map(String::as_str), Some("csv"));
        assert_eq!(merged.get("region").map(String::as_str), Some("eu"));
        assert_eq!(merged.get("requested_by").map(String::as_str), Some("admin"));
        assert_eq!(job.parameters.get("format").map(String::as_str), Some("pdf"));
    }

    #[test]
    fn zero_timeout_uses_default() {
        let job = Job::mock_job();
        assert_eq!(job.effective_timeout(DEFAULT_TIMEOUT), DEFAULT_TIMEOUT);

        let job = Job::builder("report").with_timeout_seconds(7).build().unwrap();
        assert_eq!(
            job.effective_timeout(DEFAULT_TIMEOUT),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn only_active_jobs_are_executable() {
        assert!(Job::mock_job().is_executable());
        assert!(!Job::mock_job().with_status(JobStatus::Paused).is_executable());
        assert!(!Job::mock_job()
            .with_status(JobStatus::Disabled)
            .is_executable());
    }

    #[test]
    fn max_attempts_includes_first_attempt() {
        let job = Job::builder("report").with_retry_count(3).build().unwrap();
        assert_eq!(job.max_attempts(), 4);
        assert_eq!(Job::mock_job().max_attempts(), 1);
    }

    #[test]
    fn parse_cron_accepts_five_and_six_fields() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 */5 * * * *").is_ok());
        assert_matches!(
            parse_cron("not a cron"),
            Err(JobError::InvalidCron { expression, .. }) if expression == "not a cron"
        );
    }
}
