//! Pools: groups of tasks with aggregate completion.
//!
//! Pools nest. A pool created from inside a running task has that task's
//! pool as its parent, and the top of such a chain (the pool whose parent is
//! missing or global) is the *root*. Totals, completions, and errors are
//! mirrored to the root so a top-level caller sees the progress of a whole
//! job tree.
//!
//! Completion is detected by whoever observes `all_queued && completed >=
//! total` under the pool's exit lock and wins the claim; that thread closes
//! the wait gate, runs the pool cleanups, and removes the pool from the live
//! index. Whenever a root and a child must both be locked, the root's lock is
//! taken first.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{never, select};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::error::SchedulerError;
use super::events::{build_event, EventKind};
use super::metadata::{PoolId, TaskId, TaskResult, GLOBAL_POOL_ID};
use super::task::{panic_message, ExitStatus, Task, TaskInner};
use super::worker_pool::Shared;
use crate::sync::{CancelToken, Gate};

/// Pool-level cleanup, run once when the pool completes.
pub type PoolCleanup = Box<dyn FnOnce(&Pool) + Send>;

enum Cleanups {
    Pending(Vec<PoolCleanup>),
    Done,
}

/// Aggregate progress of a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Tasks that have exited, whatever the outcome.
    pub complete: i64,
    /// Tasks that exited with an error.
    pub failed: usize,
    /// Tasks queued so far.
    pub total: i64,
    /// `100 * complete / total`, or 0 for an empty pool.
    pub progress: f64,
    /// Time since the pool was created.
    pub runtime: Duration,
}

pub(crate) struct PoolInner {
    id: PoolId,
    global: bool,
    parent: Option<Pool>,
    created_by: Option<Weak<TaskInner>>,
    token: CancelToken,
    total: AtomicI64,
    completed: AtomicI64,
    all_queued: AtomicBool,
    cancelled: AtomicBool,
    deconstructed: AtomicBool,
    exit_lock: Mutex<()>,
    waiter_count: AtomicUsize,
    waiters: Gate,
    tasks: RwLock<HashMap<TaskId, Task>>,
    errors: RwLock<Vec<Task>>,
    cleanups: Mutex<Cleanups>,
    has_queue_thread: AtomicBool,
    created_at: Instant,
    shared: Weak<Shared>,
}

impl PoolInner {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }
}

/// Handle to a group of tasks.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub(crate) fn global(token: CancelToken, shared: Weak<Shared>) -> Self {
        Self::build(GLOBAL_POOL_ID.to_string(), true, None, None, token, shared)
    }

    pub(crate) fn nested(
        parent: Option<Self>,
        created_by: Option<&Task>,
        token: CancelToken,
        shared: Weak<Shared>,
    ) -> Self {
        Self::build(
            uuid::Uuid::new_v4().to_string(),
            false,
            parent,
            created_by.map(Task::downgrade),
            token,
            shared,
        )
    }

    fn build(
        id: PoolId,
        global: bool,
        parent: Option<Self>,
        created_by: Option<Weak<TaskInner>>,
        token: CancelToken,
        shared: Weak<Shared>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                id,
                global,
                parent,
                created_by,
                token,
                total: AtomicI64::new(0),
                completed: AtomicI64::new(0),
                all_queued: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                deconstructed: AtomicBool::new(false),
                exit_lock: Mutex::new(()),
                waiter_count: AtomicUsize::new(0),
                waiters: Gate::new(),
                tasks: RwLock::new(HashMap::new()),
                errors: RwLock::new(Vec::new()),
                cleanups: Mutex::new(Cleanups::Pending(Vec::new())),
                has_queue_thread: AtomicBool::new(false),
                created_at: Instant::now(),
                shared,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<PoolInner> {
        Arc::downgrade(&self.inner)
    }

    /// Pool identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Whether this is the worker pool's global pool.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.inner.global
    }

    /// Parent pool, if this pool was created from inside a task.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.inner.parent.clone()
    }

    /// Top of this pool's hierarchy.
    ///
    /// A pool is its own root when it has no parent or its parent is global.
    #[must_use]
    pub fn root(&self) -> Self {
        let mut current = self.clone();
        while let Some(parent) = current.inner.parent.clone() {
            if parent.is_global() {
                break;
            }
            current = parent;
        }
        current
    }

    /// Whether this pool is the root of its hierarchy.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.inner
            .parent
            .as_ref()
            .is_none_or(Self::is_global)
    }

    /// Task whose handler created this pool.
    #[must_use]
    pub fn created_in_task(&self) -> Option<Task> {
        self.inner
            .created_by
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Task::from_inner)
    }

    /// Live pools that name this pool as their parent.
    #[must_use]
    pub fn children(&self) -> Vec<Self> {
        self.inner
            .shared
            .upgrade()
            .map(|shared| shared.pools_with_parent(self))
            .unwrap_or_default()
    }

    /// Cancellation token shared by tasks queued on this pool.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.inner.token.clone()
    }

    /// Tasks this pool is tracking.
    ///
    /// Tasks of non-persistent jobs drop out once they exit.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.inner.tasks.read().values().cloned().collect()
    }

    /// Tasks that exited with an error.
    #[must_use]
    pub fn errors(&self) -> Vec<Task> {
        self.inner.errors.read().clone()
    }

    /// Whether no more tasks will be queued.
    #[must_use]
    pub fn all_queued(&self) -> bool {
        self.inner.all_queued.load(Ordering::Acquire)
    }

    /// Whether the pool has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Whether the pool has reached completion.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.waiters.is_closed()
            || (!self.inner.global
                && self.all_queued()
                && self.inner.completed.load(Ordering::Acquire)
                    >= self.inner.total.load(Ordering::Acquire))
    }

    /// Counts, progress, and runtime.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let complete = self.inner.completed.load(Ordering::Acquire);
        let total = self.inner.total.load(Ordering::Acquire);
        #[allow(clippy::cast_precision_loss)]
        let progress = if total == 0 {
            0.0
        } else {
            100.0 * complete as f64 / total as f64
        };
        PoolStatus {
            complete,
            failed: self.inner.errors.read().len(),
            total,
            progress,
            runtime: self.inner.created_at.elapsed(),
        }
    }

    /// Adds `task` to this pool and sends it to the work queue.
    ///
    /// Queueing a task that is already waiting in this pool is a no-op.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::ShuttingDown`] while the worker pool stops.
    /// - [`SchedulerError::PreviouslyFailed`] if the task carries an error;
    ///   use [`Task::clear_and_recompute`] to retry it.
    /// - [`SchedulerError::AlreadyQueued`] if the task belongs to another pool.
    /// - [`SchedulerError::PoolClosed`] after [`Pool::signal_all_queued`] or
    ///   [`Pool::cancel`].
    pub fn queue_task(&self, task: &Task) -> Result<(), SchedulerError> {
        let shared = self
            .inner
            .shared
            .upgrade()
            .ok_or(SchedulerError::ShuttingDown)?;
        if shared.is_shutting_down() {
            return Err(SchedulerError::ShuttingDown);
        }
        if task.has_error() {
            return Err(SchedulerError::PreviouslyFailed(task.id().to_string()));
        }
        if let Some(owner) = task.pool() {
            if !owner.ptr_eq(self) {
                return Err(SchedulerError::AlreadyQueued {
                    task: task.id().to_string(),
                    pool: owner.id().to_string(),
                });
            }
            if !task.is_created() {
                debug!(task_id = %task.id(), pool_id = %self.id(), "task already queued in pool");
                return Ok(());
            }
        }

        let root = self.root();
        {
            let _locks = self.lock_with_root(&root);
            if self.all_queued() {
                return Err(SchedulerError::PoolClosed(self.inner.id.clone()));
            }
            self.inner.total.fetch_add(1, Ordering::AcqRel);
            if !root.ptr_eq(self) {
                root.inner.total.fetch_add(1, Ordering::AcqRel);
            }
            task.mark_queued(self);
            self.inner
                .tasks
                .write()
                .insert(task.id().to_string(), task.clone());
        }

        shared.submit(task.clone(), self.id());
        Ok(())
    }

    /// Blocks until the pool completes.
    ///
    /// With `supplement`, a replacement worker covers the caller's worker
    /// slot for the duration of the park, so a handler can wait on its own
    /// children even on a single-worker pool. Passing the calling `task`
    /// marks it `Sleeping` (and sets `waiting` in its result) while parked,
    /// and lets its cancellation end the wait.
    ///
    /// Returns at once for the global pool and for complete pools.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Canceled`] if the pool, its creating task, or
    /// `task` is cancelled first; [`SchedulerError::Internal`] if the
    /// replacement worker cannot be spawned.
    pub fn wait(&self, supplement: bool, task: Option<&Task>) -> Result<(), SchedulerError> {
        if self.inner.global {
            warn!("not waiting on the global pool");
            return Ok(());
        }
        if self.is_complete() {
            return Ok(());
        }
        if !self.all_queued() {
            warn!(pool_id = %self.inner.id, "waiting on pool before all tasks were queued");
        }

        let _waiter = WaiterGuard::enter(&self.inner);
        let _supplement = if supplement {
            match self.inner.shared.upgrade() {
                Some(shared) => Some(Supplement::start(shared)?),
                None => None,
            }
        } else {
            None
        };
        let _sleeping = task.map(Sleeping::enter);

        let task_token = task.map(Task::cancel_token);
        let none = never::<()>();
        let task_done = task_token.as_ref().map_or(&none, CancelToken::done);

        select! {
            recv(self.inner.waiters.receiver()) -> _ => {}
            recv(self.inner.token.done()) -> _ => {}
            recv(task_done) -> _ => {}
        }

        if self.inner.waiters.is_closed() {
            Ok(())
        } else {
            debug!(pool_id = %self.inner.id, "pool wait interrupted by cancellation");
            Err(SchedulerError::Canceled)
        }
    }

    /// Marks that no more tasks will be queued.
    ///
    /// If every queued task has already finished, the pool completes here.
    pub fn signal_all_queued(&self) {
        if self.inner.global {
            error!("cannot signal all queued on the global pool");
            return;
        }
        let claimed = {
            let _guard = self.inner.exit_lock.lock();
            if self.inner.all_queued.swap(true, Ordering::AcqRel) {
                debug!(pool_id = %self.inner.id, "pool already signalled all queued");
            }
            self.claim_completion()
        };
        self.release_queue_thread();
        if claimed {
            self.deconstruct();
        }
    }

    /// Cancels every tracked task and every child pool.
    ///
    /// Idempotent. The pool is closed to new tasks.
    pub fn cancel(&self) {
        if self.inner.global {
            warn!("refusing to cancel the global pool");
            return;
        }
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(pool_id = %self.inner.id, "cancelling pool");

        let claimed = {
            let _guard = self.inner.exit_lock.lock();
            self.inner.all_queued.store(true, Ordering::Release);
            self.claim_completion()
        };
        for task in self.tasks() {
            task.cancel();
        }
        self.inner.token.cancel();
        for child in self.children() {
            child.cancel();
        }
        self.emit(EventKind::PoolCancelled);
        self.release_queue_thread();
        if claimed {
            self.deconstruct();
        }
    }

    /// Registers a cleanup that runs once when the pool completes.
    ///
    /// On a pool that has already completed the cleanup runs on a fresh
    /// thread.
    pub fn add_cleanup(&self, cleanup: impl FnOnce(&Self) + Send + 'static) {
        let mut cleanups = self.inner.cleanups.lock();
        match &mut *cleanups {
            Cleanups::Pending(list) => list.push(Box::new(cleanup)),
            Cleanups::Done => {
                drop(cleanups);
                let pool = self.clone();
                let spawned = thread::Builder::new()
                    .name(format!("pool-cleanup-{}", self.inner.id))
                    .spawn(move || pool.run_cleanup(Box::new(cleanup)));
                if let Err(err) = spawned {
                    error!(pool_id = %self.inner.id, error = %err, "failed to spawn late pool cleanup");
                }
            }
        }
    }

    /// Locks this pool's exit state.
    ///
    /// Hold it to read counters consistently or to make a burst of
    /// [`Pool::queue_task`] calls atomic with respect to completion.
    pub fn lock_exit(&self) -> MutexGuard<'_, ()> {
        self.inner.exit_lock.lock()
    }

    /// Whether both handles refer to the same pool.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn set_queue_thread(&self) {
        self.inner.has_queue_thread.store(true, Ordering::Release);
    }

    /// Bookkeeping after a worker finishes one of this pool's tasks.
    pub(crate) fn handle_task_exit(&self, task: &Task, exit_status: ExitStatus) {
        let root = self.root();
        let same = root.ptr_eq(self);

        if exit_status == ExitStatus::Error {
            if !self.inner.global {
                self.inner.errors.write().push(task.clone());
            }
            if !same && !root.inner.global {
                root.inner.errors.write().push(task.clone());
            }
        }

        if !task.options().persistent {
            let mut tasks = self.inner.tasks.write();
            if tasks.get(task.id()).is_some_and(|tracked| tracked.ptr_eq(task)) {
                tasks.remove(task.id());
            }
        }

        let (own, root_claim) = {
            let _locks = self.lock_with_root(&root);
            self.inner.completed.fetch_add(1, Ordering::AcqRel);
            if same {
                (self.claim_completion(), false)
            } else {
                root.inner.completed.fetch_add(1, Ordering::AcqRel);
                (self.claim_completion(), root.claim_completion())
            }
        };

        if own {
            self.deconstruct();
        }
        if root_claim {
            root.deconstruct();
        }
    }

    /// Root lock first, then this pool's.
    fn lock_with_root<'a>(
        &'a self,
        root: &'a Self,
    ) -> (Option<MutexGuard<'a, ()>>, MutexGuard<'a, ()>) {
        let root_guard = (!root.ptr_eq(self)).then(|| root.inner.exit_lock.lock());
        (root_guard, self.inner.exit_lock.lock())
    }

    /// Must be called with the exit lock held. True for exactly one caller.
    fn claim_completion(&self) -> bool {
        !self.inner.global
            && self.inner.all_queued.load(Ordering::Acquire)
            && self.inner.completed.load(Ordering::Acquire)
                >= self.inner.total.load(Ordering::Acquire)
            && !self.inner.deconstructed.swap(true, Ordering::AcqRel)
    }

    fn deconstruct(&self) {
        self.inner.waiters.close();
        while self.inner.waiter_count.load(Ordering::Acquire) > 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let pending = std::mem::replace(&mut *self.inner.cleanups.lock(), Cleanups::Done);
        if let Cleanups::Pending(list) = pending {
            for cleanup in list {
                self.run_cleanup(cleanup);
            }
        }

        self.release_queue_thread();
        if let Some(shared) = self.inner.shared.upgrade() {
            shared.remove_pool(&self.inner.id);
        }
        self.emit(EventKind::PoolComplete);
        debug!(pool_id = %self.inner.id, total = self.inner.total.load(Ordering::Acquire), "pool complete");
    }

    fn run_cleanup(&self, cleanup: PoolCleanup) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| cleanup(self))) {
            error!(
                pool_id = %self.inner.id,
                panic = %panic_message(payload.as_ref()),
                "pool cleanup panicked"
            );
        }
    }

    fn release_queue_thread(&self) {
        if self.inner.has_queue_thread.swap(false, Ordering::AcqRel) {
            if let Some(shared) = self.inner.shared.upgrade() {
                shared.drop_replacement();
            }
        }
    }

    fn emit(&self, kind: EventKind) {
        if let Some(shared) = self.inner.shared.upgrade() {
            shared.emit(|| build_event(kind, self.inner.id.clone(), None, None));
        }
    }
}

impl PartialEq for Pool {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Pool {}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("global", &self.inner.global)
            .field("total", &self.inner.total.load(Ordering::Relaxed))
            .field("completed", &self.inner.completed.load(Ordering::Relaxed))
            .field("all_queued", &self.all_queued())
            .finish_non_exhaustive()
    }
}

struct WaiterGuard<'a>(&'a PoolInner);

impl<'a> WaiterGuard<'a> {
    fn enter(pool: &'a PoolInner) -> Self {
        pool.waiter_count.fetch_add(1, Ordering::AcqRel);
        Self(pool)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.waiter_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Hands the caller's worker slot to a replacement thread while parked.
///
/// Only a worker thread of the same pool counts towards `busy`.
struct Supplement {
    shared: Arc<Shared>,
    worker: bool,
}

impl Supplement {
    fn start(shared: Arc<Shared>) -> Result<Self, SchedulerError> {
        shared.add_replacement()?;
        let worker = shared.on_worker_thread();
        if worker {
            shared.mark_idle();
        }
        Ok(Self { shared, worker })
    }
}

impl Drop for Supplement {
    fn drop(&mut self) {
        if self.worker {
            self.shared.mark_busy();
        }
        self.shared.drop_replacement();
    }
}

struct Sleeping<'a>(&'a Task);

impl<'a> Sleeping<'a> {
    fn enter(task: &'a Task) -> Self {
        task.set_sleeping(true);
        task.set_result(TaskResult::from([(
            "waiting".to_string(),
            serde_json::Value::Bool(true),
        )]));
        Self(task)
    }
}

impl Drop for Sleeping<'_> {
    fn drop(&mut self) {
        self.0.set_sleeping(false);
        self.0.set_result(TaskResult::from([(
            "waiting".to_string(),
            serde_json::Value::Bool(false),
        )]));
    }
}
