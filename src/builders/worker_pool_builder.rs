//! Builder that assembles a worker pool from configuration and job registrations.

use std::fmt;
use std::sync::Arc;

use crate::config::WorkerPoolConfig;
use crate::core::{EventSink, JobHandler, JobOptions, SchedulerError, WorkerPool};

/// Collects configuration, jobs, and an event sink, then builds the pool.
///
/// ```
/// use vault_scheduler::builders::WorkerPoolBuilder;
/// use vault_scheduler::config::WorkerPoolConfig;
/// use vault_scheduler::core::{JobOptions, JobResult, Task};
///
/// let pool = WorkerPoolBuilder::new(WorkerPoolConfig::new().with_worker_count(2))
///     .job("noop", |_: &Task| -> JobResult { Ok(()) }, JobOptions::default())
///     .build()?;
/// assert!(!pool.is_running());
/// # Ok::<(), vault_scheduler::core::SchedulerError>(())
/// ```
pub struct WorkerPoolBuilder {
    config: WorkerPoolConfig,
    jobs: Vec<(String, Arc<dyn JobHandler>, JobOptions)>,
    events: Option<Arc<dyn EventSink>>,
}

impl WorkerPoolBuilder {
    /// Starts from an explicit configuration.
    #[must_use]
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            jobs: Vec::new(),
            events: None,
        }
    }

    /// Starts from the environment (and `.env`).
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidConfig`] if a variable does not parse or the
    /// result does not validate.
    pub fn from_env() -> Result<Self, SchedulerError> {
        WorkerPoolConfig::from_env()
            .map(Self::new)
            .map_err(SchedulerError::InvalidConfig)
    }

    /// Adds a job registration.
    #[must_use]
    pub fn job(mut self, name: impl Into<String>, handler: impl JobHandler, options: JobOptions) -> Self {
        self.jobs.push((name.into(), Arc::new(handler), options));
        self
    }

    /// Sets the sink that receives lifecycle events.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Builds the pool without starting it.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidConfig`] if the configuration does not validate.
    pub fn build(self) -> Result<WorkerPool, SchedulerError> {
        let pool = WorkerPool::with_event_sink(self.config, self.events)?;
        for (name, handler, options) in self.jobs {
            pool.register_handler(&name, handler, options)?;
        }
        Ok(pool)
    }

    /// Builds the pool and calls [`WorkerPool::run`].
    ///
    /// # Errors
    ///
    /// Anything [`WorkerPoolBuilder::build`] or [`WorkerPool::run`] returns.
    pub fn start(self) -> Result<WorkerPool, SchedulerError> {
        let pool = self.build()?;
        pool.run()?;
        Ok(pool)
    }
}

impl fmt::Debug for WorkerPoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPoolBuilder")
            .field("config", &self.config)
            .field("jobs", &self.jobs.iter().map(|(name, ..)| name.as_str()).collect::<Vec<_>>())
            .field("event_sink", &self.events.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{InMemoryEventSink, JobResult, Task};

    #[test]
    fn test_build_registers_jobs_and_rejects_bad_config() {
        let err = WorkerPoolBuilder::new(WorkerPoolConfig::new().with_worker_count(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));

        let sink = Arc::new(InMemoryEventSink::new(16));
        let builder = WorkerPoolBuilder::new(WorkerPoolConfig::new().with_worker_count(1))
            .job("a", |_: &Task| -> JobResult { Ok(()) }, JobOptions::default())
            .job("b", |_: &Task| -> JobResult { Ok(()) }, JobOptions::default())
            .event_sink(sink);
        assert!(format!("{builder:?}").contains("\"a\", \"b\""));

        let pool = builder.start().unwrap();
        assert!(pool.is_running());
        pool.stop();
    }
}
