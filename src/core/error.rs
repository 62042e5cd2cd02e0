//! Error types for scheduler operations.

use std::sync::Arc;

use thiserror::Error;

use crate::core::metadata::{PoolId, TaskId};

/// Errors produced by the scheduler's own operations.
///
/// These are returned synchronously to callers of dispatch, queueing,
/// registration, and waiting. They never describe the outcome of a task
/// body; that is [`TaskError`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The metadata names a different job than the one being dispatched.
    #[error("job name `{dispatched}` does not match task metadata job `{metadata}`")]
    JobNameMismatch {
        /// Name passed to dispatch.
        dispatched: String,
        /// Name reported by the metadata.
        metadata: String,
    },
    /// The metadata failed its own verification.
    #[error("invalid metadata for job `{job}`: {reason}")]
    InvalidMetadata {
        /// Job being dispatched.
        job: String,
        /// Verification failure, rendered with its cause chain.
        reason: String,
    },
    /// No handler has been registered under this name.
    #[error("trying to dispatch non-registered job: {0}")]
    UnregisteredJob(String),
    /// Jobs can only be registered before the worker pool starts running.
    #[error("job registry is frozen, cannot register `{0}` after run")]
    RegistryFrozen(String),
    /// The worker pool is stopping or stopped.
    #[error("worker pool is shutting down")]
    ShuttingDown,
    /// The worker pool is already running.
    #[error("worker pool is already running")]
    AlreadyRunning,
    /// The pool has been marked all-queued or cancelled.
    #[error("attempting to add task to closed task pool {0}")]
    PoolClosed(PoolId),
    /// The task already belongs to a different pool.
    #[error("task {task} is already queued in another pool")]
    AlreadyQueued {
        /// Task being queued.
        task: TaskId,
        /// Pool the task belongs to.
        pool: PoolId,
    },
    /// The task carries an error from a previous run and is not retried implicitly.
    #[error("not re-queueing task {0} that has an error set")]
    PreviouslyFailed(TaskId),
    /// Hooks can no longer be registered because the task has been retired.
    #[error("task {0} has already exited, hooks are sealed")]
    HooksSealed(TaskId),
    /// The task has already exited with a non-success status.
    #[error("task {0} has already exited")]
    TaskExited(TaskId),
    /// The pool or task this handle points at is no longer live.
    #[error("task {0} is no longer attached to a live pool")]
    Detached(TaskId),
    /// Stored metadata is not of the requested type.
    #[error("task metadata is not a `{0}`")]
    MetadataType(&'static str),
    /// A wait was interrupted by cancellation instead of completion.
    #[error("wait interrupted by cancellation")]
    Canceled,
    /// A timed wait elapsed.
    #[error("operation timed out")]
    Timeout,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// An OS-level failure such as a thread that could not be spawned.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Terminal error recorded on a task.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The handler returned an error, or called [`Task::fail`](crate::core::Task::fail).
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),
    /// The handler panicked; the panic was caught by the worker.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The reaper expired the task's deadline.
    #[error("task timed out")]
    Timeout,
}

impl TaskError {
    /// Wraps a handler error.
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(Arc::new(err.into()))
    }

    /// Whether this is the reaper's timeout error.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Unwind marker returned through a handler's `Err` path.
///
/// Produced by [`Task::fail`](crate::core::Task::fail) once the real error has
/// been recorded, and by [`Task::exit_if_signaled`](crate::core::Task::exit_if_signaled)
/// when the task has been cancelled. The worker recognises it and does not
/// record it as a second failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("task exit")]
pub struct TaskExit;
