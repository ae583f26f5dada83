use std::sync::Arc;

use crate::job::Job;

use super::JobExecutor;

/// An ordered set of executors.
///
/// Resolution is a linear scan in registration order and picks the first executor that can
/// execute the job. Two executors claiming the same job type is a configuration error; it is
/// reported on registration but the first registered executor still wins.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: Vec<Arc<dyn JobExecutor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.executor_types())
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executor<E>(mut self, executor: E) -> Self
    where
        E: JobExecutor + 'static,
    {
        self.register(Arc::new(executor));
        self
    }

    pub fn register(&mut self, executor: Arc<dyn JobExecutor>) {
        if self.executor_types().contains(&executor.executor_type()) {
            tracing::warn!(
                executor_type = executor.executor_type(),
                "Executor type {} registered more than once, the first registration wins",
                executor.executor_type()
            );
        }
        self.executors.push(executor);
    }

    pub fn resolve(&self, job: &Job) -> Option<Arc<dyn JobExecutor>> {
        self.executors
            .iter()
            .find(|executor| executor.can_execute(job))
            .cloned()
    }

    pub fn executor_types(&self) -> Vec<&str> {
        self.executors
            .iter()
            .map(|executor| executor.executor_type())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
