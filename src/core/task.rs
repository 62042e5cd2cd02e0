//! Tasks: one scheduled unit of work and its lifecycle.
//!
//! A [`Task`] is a cheap, cloneable handle. The worker pool keeps one in its
//! live index for de-duplication, the owning pool tracks it while it runs,
//! and callers hold their own copies to wait on it, cancel it, or read its
//! result.
//!
//! State machine: `Created → InQueue → Executing ⇄ Sleeping → Exited`. The
//! only way back from `Exited` is [`Task::clear_and_recompute`].

use std::any::{type_name, Any};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::select;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::error::{SchedulerError, TaskError, TaskExit};
use super::events::{build_event, EventKind};
use super::job::{Job, JobOptions, JobResult};
use super::metadata::{Metadata, TaskId, TaskResult};
use super::pool::{Pool, PoolInner};
use super::worker_pool::{Shared, WorkerPool};
use crate::sync::{CancelToken, Gate};

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Constructed, not yet queued.
    Created,
    /// On the central queue or in the retry buffer.
    InQueue,
    /// A worker is running the handler.
    Executing,
    /// The handler is parked in [`Pool::wait`] on a child pool.
    Sleeping,
    /// Finished; see [`ExitStatus`] for how.
    Exited,
}

/// How a task finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// No outcome recorded yet.
    #[default]
    None,
    /// The handler completed.
    Success,
    /// The handler failed, panicked, or was failed explicitly.
    Error,
    /// The task was cancelled or timed out.
    Canceled,
}

impl ExitStatus {
    /// Whether an outcome has been recorded.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Lowercase name, empty for [`ExitStatus::None`].
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Success => "success",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cleanup hook, consumed by the run it was registered for.
pub type TaskCleanup = Box<dyn FnOnce(&Task) + Send>;

/// Hook run with the final result after a successful exit.
pub type PostAction = Box<dyn FnOnce(&TaskResult) + Send>;

type ResultCallback = Arc<dyn Fn(&TaskResult) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Hooks {
    sealed: bool,
    cleanups: Vec<TaskCleanup>,
    error_cleanups: Vec<TaskCleanup>,
    post_action: Option<PostAction>,
}

/// Everything the worker needs after the handler returns.
pub(crate) struct Finished {
    pub exit_status: ExitStatus,
    hooks: Hooks,
}

struct TaskState {
    queue_state: QueueState,
    exit_status: ExitStatus,
    result: TaskResult,
    error: Option<TaskError>,
    pool: Weak<PoolInner>,
    child_pool: Weak<PoolInner>,
    token: CancelToken,
    exit_gate: Arc<Gate>,
    retired_gate: Arc<Gate>,
    on_result: Option<ResultCallback>,
    queued_at: Option<Instant>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    worker_id: Option<usize>,
}

impl TaskState {
    fn new() -> Self {
        Self {
            queue_state: QueueState::Created,
            exit_status: ExitStatus::None,
            result: TaskResult::new(),
            error: None,
            pool: Weak::new(),
            child_pool: Weak::new(),
            token: CancelToken::new(),
            exit_gate: Arc::new(Gate::new()),
            retired_gate: Arc::new(Gate::new()),
            on_result: None,
            queued_at: None,
            started_at: None,
            finished_at: None,
            worker_id: None,
        }
    }

    const fn never_started(&self) -> bool {
        matches!(self.queue_state, QueueState::Created | QueueState::InQueue)
    }
}

pub(crate) struct TaskInner {
    id: TaskId,
    job_name: String,
    job: Job,
    metadata: RwLock<Box<dyn Metadata>>,
    state: RwLock<TaskState>,
    /// Taken after `state` when both are held.
    hooks: Mutex<Hooks>,
    deadline: Mutex<Option<Instant>>,
    /// Set while hooks run so cleanup code is not cut short by the task's own cancellation.
    exit_checks_suppressed: AtomicBool,
    shared: Weak<Shared>,
}

/// Handle to one scheduled unit of work.
///
/// Handlers receive `&Task` and use it to report results, register hooks,
/// check for cancellation, and fail explicitly. Observers use it to wait,
/// read the outcome, and cancel.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        job_name: &str,
        job: Job,
        metadata: Box<dyn Metadata>,
        shared: Weak<Shared>,
    ) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id,
                job_name: job_name.to_string(),
                job,
                metadata: RwLock::new(metadata),
                state: RwLock::new(TaskState::new()),
                hooks: Mutex::new(Hooks::default()),
                deadline: Mutex::new(None),
                exit_checks_suppressed: AtomicBool::new(false),
                shared,
            }),
        }
    }

    /// Task identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Name of the job this task runs.
    #[must_use]
    pub fn job_name(&self) -> &str {
        &self.inner.job_name
    }

    /// Options the job was registered with.
    #[must_use]
    pub fn options(&self) -> JobOptions {
        self.inner.job.options
    }

    /// Whether the task has exited, and how.
    #[must_use]
    pub fn status(&self) -> (bool, ExitStatus) {
        let st = self.inner.state.read();
        (st.queue_state == QueueState::Exited, st.exit_status)
    }

    /// Current queue state.
    #[must_use]
    pub fn queue_state(&self) -> QueueState {
        self.inner.state.read().queue_state
    }

    /// Recorded exit status.
    #[must_use]
    pub fn exit_status(&self) -> ExitStatus {
        self.inner.state.read().exit_status
    }

    /// The terminal error, if the task failed or timed out.
    #[must_use]
    pub fn read_error(&self) -> Option<TaskError> {
        self.inner.state.read().error.clone()
    }

    /// Snapshot of the result map.
    #[must_use]
    pub fn get_results(&self) -> TaskResult {
        self.inner.state.read().result.clone()
    }

    /// The metadata rendered for status reporting.
    #[must_use]
    pub fn metadata_result(&self) -> TaskResult {
        self.inner.metadata.read().format_to_result()
    }

    /// Merges `results` into the result map and notifies the result callback.
    pub fn set_result(&self, results: TaskResult) {
        self.atomic_set_result(|current| current.extend(results));
    }

    /// Transforms the result map under the task lock, then notifies the
    /// result callback with a snapshot.
    pub fn atomic_set_result(&self, update: impl FnOnce(&mut TaskResult)) {
        let notify = {
            let mut st = self.inner.state.write();
            update(&mut st.result);
            st.on_result
                .clone()
                .map(|callback| (callback, st.result.clone()))
        };
        if let Some((callback, snapshot)) = notify {
            callback(&snapshot);
        }
    }

    /// Installs the callback invoked after every result update.
    pub fn on_result(&self, callback: impl Fn(&TaskResult) + Send + Sync + 'static) {
        self.inner.state.write().on_result = Some(Arc::new(callback));
    }

    /// Registers a cleanup that runs after this run exits, whatever the outcome.
    ///
    /// Cleanups run in registration order, after error cleanups and before
    /// the post action. They must not wait on their own task.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::HooksSealed`] once the worker has started running hooks.
    pub fn set_cleanup(
        &self,
        cleanup: impl FnOnce(&Self) + Send + 'static,
    ) -> Result<(), SchedulerError> {
        let mut hooks = self.inner.hooks.lock();
        if hooks.sealed {
            return Err(SchedulerError::HooksSealed(self.inner.id.clone()));
        }
        hooks.cleanups.push(Box::new(cleanup));
        Ok(())
    }

    /// Registers a cleanup that runs only for `Error` and `Canceled` exits.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::HooksSealed`] once the worker has started running hooks.
    pub fn set_error_cleanup(
        &self,
        cleanup: impl FnOnce(&Self) + Send + 'static,
    ) -> Result<(), SchedulerError> {
        let mut hooks = self.inner.hooks.lock();
        if hooks.sealed {
            return Err(SchedulerError::HooksSealed(self.inner.id.clone()));
        }
        hooks.error_cleanups.push(Box::new(cleanup));
        Ok(())
    }

    /// Registers an action run with the final result after a successful exit.
    ///
    /// If the task already succeeded and its hooks have run, the action runs
    /// immediately on the calling thread.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::HooksSealed`] if the hooks have run and the task did
    /// not succeed.
    pub fn set_post_action(
        &self,
        action: impl FnOnce(&TaskResult) + Send + 'static,
    ) -> Result<(), SchedulerError> {
        {
            let mut hooks = self.inner.hooks.lock();
            if !hooks.sealed {
                hooks.post_action = Some(Box::new(action));
                return Ok(());
            }
        }
        // Sealing happens after the outcome is final.
        let st = self.inner.state.read();
        if st.exit_status != ExitStatus::Success {
            return Err(SchedulerError::HooksSealed(self.inner.id.clone()));
        }
        let result = st.result.clone();
        drop(st);
        action(&result);
        Ok(())
    }

    /// Registers a deadline with the reaper.
    ///
    /// Calling it again moves the deadline; the reaper re-checks the current
    /// deadline before expiring the task.
    pub fn set_timeout(&self, deadline: Instant) {
        *self.inner.deadline.lock() = Some(deadline);
        match self.inner.shared.upgrade() {
            Some(shared) => shared.add_hit(deadline, self.clone()),
            None => warn!(task_id = %self.inner.id, "worker pool is gone, timeout will not fire"),
        }
    }

    /// Clears the deadline, turning any pending reaper hit into a no-op.
    pub fn clear_timeout(&self) {
        *self.inner.deadline.lock() = None;
    }

    /// Current deadline, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Instant> {
        *self.inner.deadline.lock()
    }

    /// Blocks until the task has exited and its cleanups have run.
    ///
    /// Cancellation of the caller does not unblock this; only the task's own
    /// exit does.
    pub fn wait(&self) {
        let gate = Arc::clone(&self.inner.state.read().exit_gate);
        gate.wait();
    }

    /// Like [`Task::wait`], giving up after `timeout`.
    ///
    /// Returns `true` if the task exited.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let gate = Arc::clone(&self.inner.state.read().exit_gate);
        gate.wait_timeout(timeout)
    }

    /// Cancels the task and its child pool.
    ///
    /// Idempotent. A task that already has an outcome keeps it. A task that
    /// never started is marked exited at once and its waiters are released;
    /// a running task exits when its handler observes the cancellation.
    pub fn cancel(&self) {
        let (release, child) = {
            let mut st = self.inner.state.write();
            st.token.cancel();
            if st.exit_status == ExitStatus::None {
                st.exit_status = ExitStatus::Canceled;
            }
            let release = if st.never_started() {
                st.queue_state = QueueState::Exited;
                Some(Arc::clone(&st.exit_gate))
            } else {
                None
            };
            (release, st.child_pool.upgrade())
        };
        debug!(task_id = %self.inner.id, job_name = %self.inner.job_name, "task cancelled");

        if let Some(gate) = release {
            gate.close();
        }
        if let Some(child) = child {
            Pool::from_inner(child).cancel();
        }
    }

    /// Records `err` as the terminal error and cancels the task.
    ///
    /// Returns the exit marker for the handler to propagate:
    ///
    /// ```ignore
    /// if missing {
    ///     return Err(task.fail(anyhow::anyhow!("file vanished")));
    /// }
    /// ```
    ///
    /// If the task already has an outcome (for example it was cancelled
    /// first) the error is discarded.
    #[must_use = "return the marker from the handler so the task unwinds"]
    pub fn fail(&self, err: impl Into<anyhow::Error>) -> anyhow::Error {
        self.record_error(TaskError::failed(err));
        TaskExit.into()
    }

    /// Marks the task exited with success unless it already has an outcome.
    pub fn success(&self) {
        let mut st = self.inner.state.write();
        if st.exit_status == ExitStatus::None {
            st.exit_status = ExitStatus::Success;
            st.queue_state = QueueState::Exited;
        }
    }

    /// Whether the handler should stop because the task was cancelled.
    ///
    /// Always `false` while the task's hooks run.
    #[must_use]
    pub fn check_exit(&self) -> bool {
        !self.inner.exit_checks_suppressed.load(Ordering::Acquire)
            && self.inner.state.read().token.is_cancelled()
    }

    /// Returns the exit marker if the task was cancelled.
    ///
    /// ```ignore
    /// for chunk in chunks {
    ///     task.exit_if_signaled()?;
    ///     process(chunk)?;
    /// }
    /// ```
    ///
    /// # Errors
    ///
    /// [`TaskExit`] when [`Task::check_exit`] is true.
    pub fn exit_if_signaled(&self) -> Result<(), TaskExit> {
        if self.check_exit() {
            Err(TaskExit)
        } else {
            Ok(())
        }
    }

    /// Cancellation token for this run, for use in `select!`.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.inner.state.read().token.clone()
    }

    /// Pool the task was queued on.
    #[must_use]
    pub fn pool(&self) -> Option<Pool> {
        self.inner.state.read().pool.upgrade().map(Pool::from_inner)
    }

    /// Pool created by this task's handler, while it is live.
    #[must_use]
    pub fn child_pool(&self) -> Option<Pool> {
        self.inner
            .state
            .read()
            .child_pool
            .upgrade()
            .map(Pool::from_inner)
    }

    /// Worker pool this task belongs to, for dispatching child work.
    #[must_use]
    pub fn worker_pool(&self) -> Option<WorkerPool> {
        self.inner.shared.upgrade().map(WorkerPool::from_shared)
    }

    /// Id of the worker thread that picked the task up.
    #[must_use]
    pub fn worker_id(&self) -> Option<usize> {
        self.inner.state.read().worker_id
    }

    /// Time spent executing so far, or in total once finished.
    #[must_use]
    pub fn exe_time(&self) -> Duration {
        let st = self.inner.state.read();
        match (st.started_at, st.finished_at) {
            (None, _) => Duration::ZERO,
            (Some(start), None) => start.elapsed(),
            (Some(start), Some(finish)) => finish.saturating_duration_since(start),
        }
    }

    /// Time spent waiting in the queue before a worker picked the task up.
    #[must_use]
    pub fn queue_time(&self) -> Duration {
        let st = self.inner.state.read();
        match (st.queued_at, st.started_at) {
            (None, _) => Duration::ZERO,
            (Some(queued), None) => queued.elapsed(),
            (Some(queued), Some(start)) => start.saturating_duration_since(queued),
        }
    }

    /// Mutates the metadata while the task may still be running.
    ///
    /// Useful for streaming more input into a long-lived task.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::MetadataType`] if the metadata is not an `M`, or
    /// whatever `update` returns.
    pub fn manipulate<M, R>(&self, update: impl FnOnce(&mut M) -> anyhow::Result<R>) -> anyhow::Result<R>
    where
        M: Metadata,
    {
        let mut guard = self.inner.metadata.write();
        let any: &mut dyn Any = &mut **guard;
        let meta = any
            .downcast_mut::<M>()
            .ok_or(SchedulerError::MetadataType(type_name::<M>()))?;
        update(meta)
    }

    /// Reads the metadata as an `M`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::MetadataType`] if the metadata is not an `M`.
    pub fn with_metadata<M, R>(&self, read: impl FnOnce(&M) -> R) -> Result<R, SchedulerError>
    where
        M: Metadata,
    {
        let guard = self.inner.metadata.read();
        let any: &dyn Any = &**guard;
        any.downcast_ref::<M>()
            .map(read)
            .ok_or(SchedulerError::MetadataType(type_name::<M>()))
    }

    /// Cancels the task, waits for it to retire, resets it, and queues it
    /// again on the same pool.
    ///
    /// This is the only way to retry a failed task.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ShuttingDown`] if the worker pool stops while
    /// waiting, [`SchedulerError::Detached`] if the task's pool is gone, or
    /// any error from [`Pool::queue_task`].
    pub fn clear_and_recompute(&self) -> Result<(), SchedulerError> {
        let shared = self
            .inner
            .shared
            .upgrade()
            .ok_or(SchedulerError::ShuttingDown)?;
        let pool = self
            .pool()
            .ok_or_else(|| SchedulerError::Detached(self.inner.id.clone()))?;

        self.cancel();
        let retired = Arc::clone(&self.inner.state.read().retired_gate);
        select! {
            recv(retired.receiver()) -> _ => {}
            recv(shared.shutdown_signal()) -> _ => return Err(SchedulerError::ShuttingDown),
        }

        {
            let mut st = self.inner.state.write();
            if let Some(err) = &st.error {
                warn!(task_id = %self.inner.id, error = %err, "retrying task that has a previous error");
            }
            let mut fresh = TaskState::new();
            fresh.pool = st.pool.clone();
            fresh.on_result = st.on_result.take();
            *st = fresh;
        }
        *self.inner.hooks.lock() = Hooks::default();
        *self.inner.deadline.lock() = None;

        shared.index_task(self);
        if let Err(err) = pool.queue_task(self) {
            shared.unindex_task(self);
            self.abandon();
            return Err(err);
        }
        Ok(())
    }

    /// Whether both handles refer to the same task.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn from_inner(inner: Arc<TaskInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<TaskInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn has_error(&self) -> bool {
        self.inner.state.read().error.is_some()
    }

    pub(crate) fn is_created(&self) -> bool {
        self.inner.state.read().queue_state == QueueState::Created
    }

    /// Attaches the task to `pool` and moves it to `InQueue`.
    pub(crate) fn mark_queued(&self, pool: &Pool) {
        let mut st = self.inner.state.write();
        st.pool = pool.downgrade();
        st.token = pool.cancel_token().child();
        st.queue_state = QueueState::InQueue;
        st.queued_at = Some(Instant::now());
    }

    pub(crate) fn set_child_pool(&self, pool: &Pool) {
        self.inner.state.write().child_pool = pool.downgrade();
    }

    pub(crate) fn set_sleeping(&self, sleeping: bool) {
        let mut st = self.inner.state.write();
        match (sleeping, st.queue_state) {
            (true, QueueState::Executing) => st.queue_state = QueueState::Sleeping,
            (false, QueueState::Sleeping) => st.queue_state = QueueState::Executing,
            _ => {}
        }
    }

    /// Claims the task for a worker; returns whether the handler should run.
    ///
    /// A task that already has an outcome, or whose token fired while it was
    /// queued, is marked exited without running.
    pub(crate) fn begin(&self, worker_id: usize) -> bool {
        let mut st = self.inner.state.write();
        st.worker_id = Some(worker_id);
        if st.exit_status.is_terminal() || st.token.is_cancelled() {
            if st.exit_status == ExitStatus::None {
                st.exit_status = ExitStatus::Canceled;
            }
            st.queue_state = QueueState::Exited;
            return false;
        }
        st.queue_state = QueueState::Executing;
        st.started_at = Some(Instant::now());
        true
    }

    /// Runs the handler, converting panics into task errors.
    pub(crate) fn execute(&self) {
        let handler = Arc::clone(&self.inner.job.handler);
        let outcome: std::thread::Result<JobResult> =
            catch_unwind(AssertUnwindSafe(|| handler.run(self)));

        match outcome {
            Ok(Ok(())) => self.settle(false),
            Ok(Err(err)) if err.is::<TaskExit>() => self.settle(true),
            Ok(Err(err)) => {
                self.record_error(TaskError::failed(err));
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(task_id = %self.inner.id, job_name = %self.inner.job_name, panic = %message, "task handler panicked");
                self.record_error(TaskError::Panicked(message));
            }
        }
    }

    /// Seals the hooks and takes them for running.
    pub(crate) fn seal(&self) -> Finished {
        let mut st = self.inner.state.write();
        st.queue_state = QueueState::Exited;
        if st.finished_at.is_none() {
            st.finished_at = Some(Instant::now());
        }
        let mut slot = self.inner.hooks.lock();
        let hooks = std::mem::take(&mut *slot);
        slot.sealed = true;
        drop(slot);
        Finished {
            exit_status: st.exit_status,
            hooks,
        }
    }

    /// Runs error cleanups, cleanups, then the post action, with exit checks suppressed.
    pub(crate) fn run_hooks(&self, finished: Finished) {
        let Finished { exit_status, hooks } = finished;
        self.inner.exit_checks_suppressed.store(true, Ordering::Release);

        if matches!(exit_status, ExitStatus::Error | ExitStatus::Canceled) {
            for cleanup in hooks.error_cleanups {
                self.guarded("error cleanup", || cleanup(self));
            }
        }
        for cleanup in hooks.cleanups {
            self.guarded("cleanup", || cleanup(self));
        }
        if exit_status == ExitStatus::Success {
            if let Some(action) = hooks.post_action {
                let result = self.get_results();
                self.guarded("post action", || action(&result));
            }
        }

        self.inner.exit_checks_suppressed.store(false, Ordering::Release);
    }

    /// Releases everyone blocked in [`Task::wait`].
    pub(crate) fn release_waiters(&self) {
        let gate = Arc::clone(&self.inner.state.read().exit_gate);
        gate.close();
    }

    /// Signals that the worker is completely done with this run.
    pub(crate) fn retire(&self) {
        let gate = Arc::clone(&self.inner.state.read().retired_gate);
        gate.close();
    }

    /// Gives up on a task that will never reach a worker.
    pub(crate) fn abandon(&self) {
        let (exit, retired) = {
            let mut st = self.inner.state.write();
            st.token.cancel();
            if st.exit_status == ExitStatus::None {
                st.exit_status = ExitStatus::Canceled;
            }
            st.queue_state = QueueState::Exited;
            (Arc::clone(&st.exit_gate), Arc::clone(&st.retired_gate))
        };
        exit.close();
        retired.close();
    }

    /// Expires the task if its current deadline has passed.
    pub(crate) fn expire_if_due(&self, now: Instant) -> bool {
        let due = matches!(*self.inner.deadline.lock(), Some(deadline) if deadline <= now);
        due && self.expire()
    }

    fn expire(&self) -> bool {
        let (release, child, pool_id) = {
            let mut st = self.inner.state.write();
            if st.queue_state == QueueState::Exited {
                return false;
            }
            st.error = Some(TaskError::Timeout);
            st.exit_status = ExitStatus::Canceled;
            st.token.cancel();
            let release = if st.never_started() {
                st.queue_state = QueueState::Exited;
                Some(Arc::clone(&st.exit_gate))
            } else {
                None
            };
            let pool_id = st.pool.upgrade().map(|p| p.id().to_string());
            (release, st.child_pool.upgrade(), pool_id)
        };
        warn!(task_id = %self.inner.id, job_name = %self.inner.job_name, "task deadline expired, cancelling");

        if let Some(gate) = release {
            gate.close();
        }
        if let Some(child) = child {
            Pool::from_inner(child).cancel();
        }
        if let Some(shared) = self.inner.shared.upgrade() {
            shared.emit(|| {
                build_event(
                    EventKind::TaskTimedOut,
                    pool_id.unwrap_or_default(),
                    Some((self.id(), self.job_name())),
                    None,
                )
            });
        }
        true
    }

    /// Records the outcome of a handler that returned without an error.
    fn settle(&self, exited_early: bool) {
        let mut st = self.inner.state.write();
        if st.exit_status == ExitStatus::None {
            st.exit_status = if exited_early || st.token.is_cancelled() {
                ExitStatus::Canceled
            } else {
                ExitStatus::Success
            };
        }
        st.queue_state = QueueState::Exited;
    }

    fn record_error(&self, err: TaskError) -> bool {
        let mut st = self.inner.state.write();
        if st.exit_status.is_terminal() || st.queue_state == QueueState::Exited {
            debug!(task_id = %self.inner.id, error = %err, "discarding error raised after exit");
            return false;
        }
        if st.token.is_cancelled() {
            debug!(task_id = %self.inner.id, error = %err, "discarding error raised after cancellation");
            st.exit_status = ExitStatus::Canceled;
            st.queue_state = QueueState::Exited;
            return false;
        }
        warn!(task_id = %self.inner.id, job_name = %self.inner.job_name, error = %err, "task failed");
        st.error = Some(err);
        st.exit_status = ExitStatus::Error;
        st.queue_state = QueueState::Exited;
        st.token.cancel();
        true
    }

    fn guarded(&self, what: &str, hook: impl FnOnce()) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(hook)) {
            error!(
                task_id = %self.inner.id,
                hook = what,
                panic = %panic_message(payload.as_ref()),
                "task hook panicked"
            );
        }
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Task {}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Task");
        out.field("id", &self.inner.id)
            .field("job_name", &self.inner.job_name);
        if let Some(st) = self.inner.state.try_read() {
            out.field("queue_state", &st.queue_state)
                .field("exit_status", &st.exit_status);
        }
        out.finish_non_exhaustive()
    }
}

/// Renders a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobOptions;

    #[derive(Debug)]
    struct Echo(u32);

    impl Metadata for Echo {
        fn job_name(&self) -> &str {
            "echo"
        }

        fn meta_string(&self) -> String {
            format!("echo:{}", self.0)
        }
    }

    fn detached_task() -> Task {
        let job = Job {
            handler: Arc::new(|_: &Task| -> JobResult { Ok(()) }),
            options: JobOptions::default(),
        };
        Task::new("t1".into(), "echo", job, Box::new(Echo(1)), Weak::new())
    }

    #[test]
    fn test_handles_cross_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Task>();
        assert_send_sync::<Pool>();
        assert_send_sync::<WorkerPool>();

        let task = detached_task();
        task.set_cleanup(|_| {}).expect("open");
        let moved = task.clone();
        std::thread::spawn(move || moved.set_error_cleanup(|_| {}))
            .join()
            .expect("thread")
            .expect("open");
        assert_eq!(task.status(), (false, ExitStatus::None));
    }

    #[test]
    fn test_cancel_never_started_releases_waiters() {
        let task = detached_task();
        task.cancel();

        assert_eq!(task.status(), (true, ExitStatus::Canceled));
        assert!(task.wait_timeout(Duration::from_millis(10)));
        assert!(task.read_error().is_none());
    }

    #[test]
    fn test_terminal_status_is_monotonic() {
        let task = detached_task();
        assert!(task.begin(0));
        task.success();
        let _ = task.fail(anyhow::anyhow!("late"));
        task.cancel();

        assert_eq!(task.status(), (true, ExitStatus::Success));
        assert!(task.read_error().is_none());
    }

    #[test]
    fn test_fail_records_error_and_cancels_token() {
        let task = detached_task();
        assert!(task.begin(0));
        let marker = task.fail(anyhow::anyhow!("boom"));

        assert!(marker.is::<TaskExit>());
        assert_eq!(task.status(), (true, ExitStatus::Error));
        assert_eq!(task.read_error().unwrap().to_string(), "boom");
        assert!(task.cancel_token().is_cancelled());
    }

    #[test]
    fn test_error_after_cancel_is_discarded() {
        let task = detached_task();
        assert!(task.begin(0));
        task.cancel();
        assert_eq!(task.queue_state(), QueueState::Executing);

        let _ = task.fail(anyhow::anyhow!("file moved"));
        assert_eq!(task.exit_status(), ExitStatus::Canceled);
        assert!(task.read_error().is_none());
    }

    #[test]
    fn test_result_callback_sees_merged_snapshot() {
        let task = detached_task();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            task.on_result(move |result| seen.lock().push(result.len()));
        }

        task.set_result(TaskResult::from([("a".to_string(), 1.into())]));
        task.set_result(TaskResult::from([("b".to_string(), 2.into())]));
        task.atomic_set_result(|r| {
            r.insert("a".into(), 3.into());
        });

        assert_eq!(*seen.lock(), vec![1, 2, 2]);
        assert_eq!(task.get_results()["a"], serde_json::json!(3));
    }

    #[test]
    fn test_hooks_sealed_after_seal() {
        let task = detached_task();
        assert!(task.begin(0));
        task.execute();
        let finished = task.seal();
        assert_eq!(finished.exit_status, ExitStatus::Success);

        assert!(matches!(task.set_cleanup(|_| {}), Err(SchedulerError::HooksSealed(_))));

        let ran = Arc::new(AtomicBool::new(false));
        {
            let ran = Arc::clone(&ran);
            task.set_post_action(move |_| ran.store(true, Ordering::SeqCst))
                .unwrap();
        }
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_hooks_run_in_order_with_exit_checks_suppressed() {
        let task = detached_task();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            let order = Arc::clone(&order);
            task.set_cleanup(move |t| {
                assert!(!t.check_exit());
                order.lock().push(name);
            })
            .unwrap();
        }
        {
            let order = Arc::clone(&order);
            task.set_error_cleanup(move |_| order.lock().push("error"))
                .unwrap();
        }
        {
            let order = Arc::clone(&order);
            task.set_post_action(move |_| order.lock().push("post"))
                .unwrap();
        }

        assert!(task.begin(0));
        task.cancel();
        task.execute();
        let finished = task.seal();
        task.run_hooks(finished);

        assert_eq!(*order.lock(), vec!["error", "first", "second"]);
        assert!(task.check_exit());
    }

    #[test]
    fn test_handler_panic_becomes_task_error() {
        let job = Job {
            handler: Arc::new(|_: &Task| -> JobResult { panic!("kaboom") }),
            options: JobOptions::default(),
        };
        let task = Task::new("t2".into(), "echo", job, Box::new(Echo(2)), Weak::new());
        assert!(task.begin(0));
        task.execute();

        assert_eq!(task.exit_status(), ExitStatus::Error);
        assert!(matches!(task.read_error(), Some(TaskError::Panicked(msg)) if msg == "kaboom"));
    }

    #[test]
    fn test_metadata_access_is_typed() {
        let task = detached_task();
        assert_eq!(task.with_metadata(|m: &Echo| m.0).unwrap(), 1);
        task.manipulate(|m: &mut Echo| {
            m.0 = 7;
            Ok(())
        })
        .unwrap();
        assert_eq!(task.with_metadata(|m: &Echo| m.0).unwrap(), 7);

        #[derive(Debug)]
        struct Other;
        impl Metadata for Other {
            fn job_name(&self) -> &str {
                "other"
            }
            fn meta_string(&self) -> String {
                String::new()
            }
        }
        assert!(matches!(
            task.with_metadata(|_: &Other| ()),
            Err(SchedulerError::MetadataType(_))
        ));
    }

    #[test]
    fn test_expire_respects_current_deadline() {
        let task = detached_task();
        assert!(task.begin(0));
        let now = Instant::now();

        *task.inner.deadline.lock() = Some(now + Duration::from_secs(60));
        assert!(!task.expire_if_due(now));

        task.clear_timeout();
        assert!(!task.expire_if_due(now));

        *task.inner.deadline.lock() = Some(now);
        assert!(task.expire_if_due(now));
        assert_eq!(task.exit_status(), ExitStatus::Canceled);
        assert!(task.read_error().unwrap().is_timeout());
    }
}
