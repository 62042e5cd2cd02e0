//! Job handlers, registration options, and the registry that holds them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{SchedulerError, Task};

/// Result of one handler invocation.
pub type JobResult = anyhow::Result<()>;

/// Body of a registered job.
///
/// Handlers run on a worker thread with the task they execute. Returning
/// `Err` fails the task with that error; a handler that wants to stop early
/// because it was cancelled returns the error from
/// [`Task::exit_if_signaled`](crate::core::Task::exit_if_signaled).
///
/// Any `Fn(&Task) -> JobResult` closure is a handler:
///
/// ```
/// use vault_scheduler::core::{JobHandler, JobResult, Task};
///
/// fn assert_handler<H: JobHandler>(_: H) {}
///
/// assert_handler(|task: &Task| -> JobResult {
///     task.set_result([("seen".to_string(), serde_json::Value::Bool(true))].into());
///     Ok(())
/// });
/// ```
pub trait JobHandler: Send + Sync + 'static {
    /// Executes the job for `task`.
    ///
    /// # Errors
    ///
    /// Any error is recorded as the task's terminal error.
    fn run(&self, task: &Task) -> JobResult;
}

impl<F> JobHandler for F
where
    F: Fn(&Task) -> JobResult + Send + Sync + 'static,
{
    fn run(&self, task: &Task) -> JobResult {
        self(task)
    }
}

/// Options fixed at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Keep finished tasks in the live index so they stay queryable.
    pub persistent: bool,
    /// Salt the task id with the dispatch time so duplicates can coexist.
    pub unique: bool,
    /// Whether a replacement worker may pick this job up.
    ///
    /// Jobs that park on child pools for a long time should set this to
    /// `false` so a replacement thread does not get stuck behind them too.
    pub allow_replacement: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            persistent: false,
            unique: false,
            allow_replacement: true,
        }
    }
}

impl JobOptions {
    /// Default options: evicted on completion, deduplicated, replaceable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistent flag.
    #[must_use]
    pub const fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Set the unique flag.
    #[must_use]
    pub const fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Set whether replacement workers may run this job.
    #[must_use]
    pub const fn with_allow_replacement(mut self, allow: bool) -> Self {
        self.allow_replacement = allow;
        self
    }
}

/// A registered handler together with its options.
#[derive(Clone)]
pub(crate) struct Job {
    pub handler: Arc<dyn JobHandler>,
    pub options: JobOptions,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("options", &self.options).finish_non_exhaustive()
    }
}

/// Job name to handler map, frozen once the worker pool runs.
#[derive(Debug, Default)]
pub(crate) struct JobRegistry {
    jobs: RwLock<HashMap<String, Job>>,
    frozen: AtomicBool,
}

impl JobRegistry {
    pub fn register(
        &self,
        name: &str,
        handler: Arc<dyn JobHandler>,
        options: JobOptions,
    ) -> Result<(), SchedulerError> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(SchedulerError::RegistryFrozen(name.to_string()));
        }
        self.jobs
            .write()
            .insert(name.to_string(), Job { handler, options });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Job> {
        self.jobs.read().get(name).cloned()
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &Task) -> JobResult {
        Ok(())
    }

    #[test]
    fn test_options_default_allows_replacement() {
        let opts = JobOptions::default();
        assert!(!opts.persistent);
        assert!(!opts.unique);
        assert!(opts.allow_replacement);

        let opts = opts.with_unique(true).with_allow_replacement(false);
        assert!(opts.unique);
        assert!(!opts.allow_replacement);
    }

    #[test]
    fn test_registry_freezes() {
        let registry = JobRegistry::default();
        registry
            .register("noop", Arc::new(noop), JobOptions::default())
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());

        registry.freeze();
        let err = registry
            .register("late", Arc::new(noop), JobOptions::default())
            .unwrap_err();
        assert_eq!(err, SchedulerError::RegistryFrozen("late".into()));
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let opts: JobOptions = serde_json::from_str(r#"{"persistent": true}"#).unwrap();
        assert!(opts.persistent);
        assert!(opts.allow_replacement);
    }
}
