//! A builder for [`Job`] definitions.
use chrono::Utc;

use super::{parse_cron, Job, JobError, JobId, JobStatus, Parameters};

/// Builds a [`Job`], validating the cron expression when one is given.
///
/// The id of the built job is a placeholder; repositories assign the real id on insert.
///
/// # Example
///
/// ```
/// # use jobvisor::prelude::*;
/// let job = Job::builder("health_check")
///     .with_name("ping upstream")
///     .with_cron("*/5 * * * *")
///     .with_parameter("url", "https://example.com/health")
///     .with_retry_count(2)
///     .with_timeout_seconds(30)
///     .build()
///     .unwrap();
///
/// assert!(job.is_recurring());
/// assert_eq!(job.max_attempts(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct JobBuilder {
    name: Option<String>,
    job_type: String,
    cron_expression: Option<String>,
    parameters: Parameters,
    retry_count: u32,
    timeout_seconds: u32,
    status: JobStatus,
}

impl JobBuilder {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            name: None,
            job_type: job_type.into(),
            cron_expression: None,
            parameters: Default::default(),
            retry_count: 0,
            timeout_seconds: 0,
            status: JobStatus::Active,
        }
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    pub fn with_cron(self, expression: impl Into<String>) -> Self {
        Self {
            cron_expression: Some(expression.into()),
            ..self
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn with_retry_count(self, retry_count: u32) -> Self {
        Self {
            retry_count,
            ..self
        }
    }

    /// Set the per-attempt timeout. Zero falls back to the engine default.
    pub fn with_timeout_seconds(self, timeout_seconds: u32) -> Self {
        Self {
            timeout_seconds,
            ..self
        }
    }

    pub fn with_status(self, status: JobStatus) -> Self {
        Self { status, ..self }
    }

    pub fn build(self) -> Result<Job, JobError> {
        if self.job_type.trim().is_empty() {
            return Err(JobError::MissingJobType);
        }
        if let Some(expression) = &self.cron_expression {
            parse_cron(expression)?;
        }
        Ok(Job {
            id: JobId::from(0),
            name: self.name.unwrap_or_else(|| self.job_type.clone()),
            job_type: self.job_type,
            cron_expression: self.cron_expression,
            parameters: self.parameters,
            retry_count: self.retry_count,
            timeout_seconds: self.timeout_seconds,
            status: self.status,
            last_executed_at: None,
            created_at: Utc::now(),
        })
    }
}
