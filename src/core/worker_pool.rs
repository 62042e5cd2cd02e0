//! Worker pool with dedicated OS worker threads.
//!
//! The [`WorkerPool`] owns the job registry, the bounded central queue and
//! its retry buffer, the live task and pool indexes, and four kinds of
//! background thread:
//!
//! - **workers** take tasks from the queue and run their handlers. Base
//!   workers live until [`WorkerPool::stop`]; replacement workers are added
//!   while a handler is parked in [`Pool::wait`] and retire once they are
//!   surplus.
//! - the **reaper** expires task deadlines registered with
//!   [`Task::set_timeout`].
//! - the **drainer** moves buffered tasks back into the queue as it frees up.
//! - the **status reporter** logs queue and worker counts, backing off while
//!   nothing changes.
//!
//! # Example
//!
//! ```no_run
//! use vault_scheduler::config::WorkerPoolConfig;
//! use vault_scheduler::core::{JobOptions, JobResult, Metadata, Task, WorkerPool};
//!
//! #[derive(Debug)]
//! struct Thumb {
//!     file: String,
//! }
//!
//! impl Metadata for Thumb {
//!     fn job_name(&self) -> &str {
//!         "thumb"
//!     }
//!     fn meta_string(&self) -> String {
//!         format!("thumb:{}", self.file)
//!     }
//! }
//!
//! let pool = WorkerPool::new(WorkerPoolConfig::new().with_worker_count(4))?;
//! pool.register_job(
//!     "thumb",
//!     |task: &Task| -> JobResult {
//!         let file = task.with_metadata(|m: &Thumb| m.file.clone())?;
//!         task.set_result([("file".to_string(), serde_json::Value::from(file))].into());
//!         Ok(())
//!     },
//!     JobOptions::default(),
//! )?;
//! pool.run()?;
//!
//! let task = pool.dispatch_job("thumb", Thumb { file: "a.jpg".into() }, None)?;
//! task.wait();
//! pool.stop();
//! # Ok::<(), vault_scheduler::core::SchedulerError>(())
//! ```

mod drainer;
mod reaper;
mod reporter;
mod worker;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::SchedulerError;
use super::events::{build_event, EventKind, EventSink, LifecycleEvent};
use super::job::{JobHandler, JobOptions, JobRegistry};
use super::metadata::{Metadata, PoolId, TaskId, TaskResult};
use super::pool::Pool;
use super::task::{ExitStatus, Task};
use crate::config::WorkerPoolConfig;
use crate::infra::{Backlog, Placement};
use crate::sync::{CancelToken, Gate};
use crate::util::{clock::now_nanos, hash::task_id};

pub(crate) use reaper::Hit;

/// Point-in-time counters of a worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolStatus {
    /// Tasks on the central queue.
    pub queued: usize,
    /// Tasks in the retry buffer.
    pub buffered: usize,
    /// Tasks ever queued.
    pub lifetime_queued: u64,
    /// Workers running a handler, excluding those parked in a pool wait.
    pub busy: i64,
    /// Live worker threads, replacements included.
    pub alive: usize,
    /// Worker threads the pool is aiming for.
    pub target: usize,
    /// Non-replaceable tasks handed back by replacement workers.
    pub deferred: u64,
}

/// State shared by the worker pool handle, its threads, tasks, and pools.
pub(crate) struct Shared {
    config: WorkerPoolConfig,
    registry: JobRegistry,
    global: Pool,
    root_token: CancelToken,
    tasks: RwLock<HashMap<TaskId, Task>>,
    pools: Mutex<HashMap<PoolId, Pool>>,
    queue_tx: Sender<Task>,
    queue_rx: Receiver<Task>,
    backlog: Backlog<Task>,
    hits_tx: Sender<Hit>,
    hits_rx: Receiver<Hit>,
    shutdown: Gate,
    shutting_down: AtomicBool,
    running: AtomicBool,
    alive: AtomicUsize,
    target: AtomicUsize,
    busy: AtomicI64,
    lifetime_queued: AtomicU64,
    next_worker_id: AtomicUsize,
    unique_seq: AtomicU64,
    deferred: AtomicU64,
    threads: Mutex<Vec<JoinHandle<()>>>,
    events: Option<Arc<dyn EventSink>>,
}

impl Shared {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Receiver that disconnects once [`WorkerPool::stop`] begins.
    pub(crate) fn shutdown_signal(&self) -> &Receiver<()> {
        self.shutdown.receiver()
    }

    pub(crate) fn emit(&self, event: impl FnOnce() -> LifecycleEvent) {
        if let Some(sink) = &self.events {
            sink.record(event());
        }
    }

    /// Sends a freshly queued task to the queue, or the retry buffer if the
    /// queue is saturated.
    pub(crate) fn submit(&self, task: Task, pool_id: &str) {
        self.lifetime_queued.fetch_add(1, Ordering::AcqRel);
        self.emit(|| {
            build_event(
                EventKind::TaskQueued,
                pool_id,
                Some((task.id(), task.job_name())),
                None,
            )
        });
        let task_id = task.id().to_string();
        match self.backlog.offer(task, &self.queue_tx) {
            Placement::Queued => debug!(task_id = %task_id, pool_id = %pool_id, "task queued"),
            Placement::Buffered => debug!(
                task_id = %task_id,
                pool_id = %pool_id,
                buffered = self.backlog.len(),
                "queue saturated, task buffered"
            ),
        }
    }

    /// Puts a dequeued task back without counting it again.
    pub(crate) fn requeue(&self, task: Task) {
        self.deferred.fetch_add(1, Ordering::AcqRel);
        let task_id = task.id().to_string();
        match self.backlog.offer(task, &self.queue_tx) {
            Placement::Queued => debug!(task_id = %task_id, "task requeued"),
            Placement::Buffered => debug!(
                task_id = %task_id,
                buffered = self.backlog.len(),
                "queue saturated, requeued task buffered"
            ),
        }
    }

    /// Moves dequeued tasks to the retry buffer without counting them again.
    pub(crate) fn defer_to_backlog(&self, tasks: Vec<Task>) {
        self.deferred.fetch_add(tasks.len() as u64, Ordering::AcqRel);
        debug!(deferred = tasks.len(), "replacement worker moving tasks to the retry buffer");
        self.backlog.extend(tasks);
    }

    pub(crate) fn add_hit(&self, deadline: Instant, task: Task) {
        if self.hits_tx.send(Hit { deadline, task }).is_err() {
            warn!("reaper channel closed, deadline dropped");
        }
    }

    pub(crate) fn index_task(&self, task: &Task) {
        self.tasks
            .write()
            .insert(task.id().to_string(), task.clone());
    }

    pub(crate) fn unindex_task(&self, task: &Task) {
        let mut tasks = self.tasks.write();
        if tasks.get(task.id()).is_some_and(|live| live.ptr_eq(task)) {
            tasks.remove(task.id());
        }
    }

    pub(crate) fn remove_pool(&self, id: &str) {
        self.pools.lock().remove(id);
    }

    pub(crate) fn pools_with_parent(&self, parent: &Pool) -> Vec<Pool> {
        self.pools
            .lock()
            .values()
            .filter(|pool| pool.parent().is_some_and(|p| p.ptr_eq(parent)))
            .cloned()
            .collect()
    }

    /// Raises the worker target by one and spawns a replacement to meet it.
    pub(crate) fn add_replacement(self: &Arc<Self>) -> Result<(), SchedulerError> {
        self.target.fetch_add(1, Ordering::AcqRel);
        self.spawn_worker(true).inspect_err(|_| {
            self.target.fetch_sub(1, Ordering::AcqRel);
        })
    }

    /// Lowers the worker target; the surplus replacement retires on its own.
    pub(crate) fn drop_replacement(&self) {
        let _ = self
            .target
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Whether the calling thread runs this pool's worker loop.
    pub(crate) fn on_worker_thread(&self) -> bool {
        worker::is_worker_of(self)
    }

    pub(crate) fn mark_idle(&self) {
        self.busy.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn mark_busy(&self) {
        self.busy.fetch_add(1, Ordering::AcqRel);
    }

    /// Claims one surplus worker slot. True for the caller that should exit.
    pub(crate) fn try_retire(&self) -> bool {
        let target = self.target.load(Ordering::Acquire);
        self.alive
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |alive| {
                (alive > target).then(|| alive - 1)
            })
            .is_ok()
    }

    pub(crate) fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.queue_rx.len()
    }

    /// Completion report handed to the event sink.
    pub(crate) fn final_report(&self, task: &Task, result: &TaskResult, exit: ExitStatus) -> TaskResult {
        let mut report = task.metadata_result();
        report.extend(result.iter().map(|(k, v)| (k.clone(), v.clone())));
        report.insert("task_id".into(), task.id().into());
        report.insert("exit_status".into(), exit.as_str().into());
        report.insert(
            "queue_remaining".into(),
            (self.queue_len() + self.backlog.len()).into(),
        );
        report.insert(
            "queue_total".into(),
            self.lifetime_queued.load(Ordering::Acquire).into(),
        );
        if let Some(err) = task.read_error() {
            report.insert("error".into(), err.to_string().into());
        }
        report
    }

    fn status(&self) -> WorkerPoolStatus {
        WorkerPoolStatus {
            queued: self.queue_len(),
            buffered: self.backlog.len(),
            lifetime_queued: self.lifetime_queued.load(Ordering::Acquire),
            busy: self.busy.load(Ordering::Acquire),
            alive: self.alive.load(Ordering::Acquire),
            target: self.target.load(Ordering::Acquire),
            deferred: self.deferred.load(Ordering::Acquire),
        }
    }

    fn spawn_worker(self: &Arc<Self>, replacement: bool) -> Result<(), SchedulerError> {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::AcqRel);
        let shared = Arc::clone(self);
        self.alive.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name(format!("{}-{worker_id}", self.config.thread_name_prefix))
            .stack_size(self.config.thread_stack_size)
            .spawn(move || worker::run(&shared, worker_id, replacement));
        match spawned {
            Ok(handle) => {
                self.track_thread(handle);
                Ok(())
            }
            Err(err) => {
                self.alive.fetch_sub(1, Ordering::AcqRel);
                Err(SchedulerError::Internal(format!(
                    "failed to spawn worker thread: {err}"
                )))
            }
        }
    }

    fn spawn_service(
        self: &Arc<Self>,
        name: &str,
        body: fn(&Self),
    ) -> Result<(), SchedulerError> {
        let shared = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("{}-{name}", self.config.thread_name_prefix))
            .spawn(move || body(&shared))
            .map_err(|err| SchedulerError::Internal(format!("failed to spawn {name} thread: {err}")))?;
        self.track_thread(handle);
        Ok(())
    }

    fn track_thread(&self, handle: JoinHandle<()>) {
        let mut threads = self.threads.lock();
        threads.retain(|h| !h.is_finished());
        threads.push(handle);
    }
}

/// Handle to a worker pool.
///
/// Cloning is cheap; every clone controls the same pool. Dropping the last
/// handle does not stop the threads, call [`WorkerPool::stop`].
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Creates a stopped worker pool.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidConfig`] if the configuration does not validate.
    pub fn new(config: WorkerPoolConfig) -> Result<Self, SchedulerError> {
        Self::with_event_sink(config, None)
    }

    pub(crate) fn with_event_sink(
        config: WorkerPoolConfig,
        events: Option<Arc<dyn EventSink>>,
    ) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;

        let (queue_tx, queue_rx) = bounded(config.effective_queue_capacity());
        let (hits_tx, hits_rx) = unbounded();
        let root_token = CancelToken::new();
        let target = config.worker_count;

        let shared = Arc::new_cyclic(|weak| Shared {
            global: Pool::global(root_token.clone(), weak.clone()),
            root_token,
            config,
            registry: JobRegistry::default(),
            tasks: RwLock::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
            queue_tx,
            queue_rx,
            backlog: Backlog::new(),
            hits_tx,
            hits_rx,
            shutdown: Gate::new(),
            shutting_down: AtomicBool::new(false),
            running: AtomicBool::new(false),
            alive: AtomicUsize::new(0),
            target: AtomicUsize::new(target),
            busy: AtomicI64::new(0),
            lifetime_queued: AtomicU64::new(0),
            next_worker_id: AtomicUsize::new(0),
            unique_seq: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            threads: Mutex::new(Vec::new()),
            events,
        });

        Ok(Self { shared })
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Registers a job handler under `name`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::RegistryFrozen`] once [`WorkerPool::run`] has been called.
    pub fn register_job(
        &self,
        name: &str,
        handler: impl JobHandler,
        options: JobOptions,
    ) -> Result<(), SchedulerError> {
        self.register_handler(name, Arc::new(handler), options)
    }

    pub(crate) fn register_handler(
        &self,
        name: &str,
        handler: Arc<dyn JobHandler>,
        options: JobOptions,
    ) -> Result<(), SchedulerError> {
        self.shared.registry.register(name, handler, options)?;
        debug!(job_name = %name, ?options, "job registered");
        Ok(())
    }

    /// Starts the base workers, reaper, drainer, and status reporter.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::AlreadyRunning`] on a second call,
    /// [`SchedulerError::ShuttingDown`] after [`WorkerPool::stop`], or
    /// [`SchedulerError::Internal`] if a thread cannot be spawned.
    pub fn run(&self) -> Result<(), SchedulerError> {
        if self.shared.is_shutting_down() {
            return Err(SchedulerError::ShuttingDown);
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.shared.registry.freeze();

        let workers = self.shared.config.worker_count;
        for _ in 0..workers {
            self.shared.spawn_worker(false)?;
        }
        self.shared.spawn_service("reaper", reaper::run)?;
        self.shared.spawn_service("drainer", drainer::run)?;
        self.shared.spawn_service("status", reporter::run)?;

        info!(
            workers,
            queue_capacity = self.shared.config.effective_queue_capacity(),
            jobs = self.shared.registry.len(),
            "worker pool running"
        );
        Ok(())
    }

    /// Stops the pool.
    ///
    /// Cancels every task's token so blocked handlers unwind, waits for each
    /// thread up to the configured shutdown timeout, then cancels tasks still
    /// waiting in the queue or buffer so their waiters return. Idempotent.
    pub fn stop(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("stopping worker pool");

        self.shared.shutdown.close();
        self.shared.root_token.cancel();

        let timeout = self.shared.config.shutdown_timeout();
        let threads = std::mem::take(&mut *self.shared.threads.lock());
        let count = threads.len();
        for handle in threads {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            let (tx, rx) = mpsc::channel();
            let joiner = thread::spawn(move || {
                let _ = tx.send(handle.join().is_ok());
            });
            match rx.recv_timeout(timeout) {
                Ok(true) => {
                    debug!(thread = %name, "thread joined");
                    let _ = joiner.join();
                }
                Ok(false) => {
                    warn!(thread = %name, "thread panicked");
                    let _ = joiner.join();
                }
                Err(_) => warn!(thread = %name, "thread did not exit within timeout, detaching"),
            }
        }

        let mut leftovers = self.shared.backlog.take_all();
        leftovers.extend(self.shared.queue_rx.try_iter());
        for task in &leftovers {
            task.abandon();
        }

        info!(threads = count, abandoned = leftovers.len(), "worker pool stopped");
    }

    /// Creates a task for `meta` and queues it on `pool` (the global pool
    /// when `None`).
    ///
    /// Dispatching metadata whose id matches a live task returns that task
    /// instead of creating a duplicate, unless the job is registered as
    /// unique.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::ShuttingDown`] while the pool stops.
    /// - [`SchedulerError::JobNameMismatch`] if `meta` names another job.
    /// - [`SchedulerError::InvalidMetadata`] if [`Metadata::verify`] fails.
    /// - [`SchedulerError::UnregisteredJob`] for an unknown job.
    /// - any error from [`Pool::queue_task`].
    pub fn dispatch_job<M: Metadata>(
        &self,
        job_name: &str,
        meta: M,
        pool: Option<&Pool>,
    ) -> Result<Task, SchedulerError> {
        if self.shared.is_shutting_down() {
            return Err(SchedulerError::ShuttingDown);
        }
        if meta.job_name() != job_name {
            return Err(SchedulerError::JobNameMismatch {
                dispatched: job_name.to_string(),
                metadata: meta.job_name().to_string(),
            });
        }
        meta.verify().map_err(|err| SchedulerError::InvalidMetadata {
            job: job_name.to_string(),
            reason: format!("{err:#}"),
        })?;
        let job = self
            .shared
            .registry
            .get(job_name)
            .ok_or_else(|| SchedulerError::UnregisteredJob(job_name.to_string()))?;

        let salt = job
            .options
            .unique
            .then(|| (now_nanos(), self.shared.unique_seq.fetch_add(1, Ordering::AcqRel)));
        let id = task_id(&meta.meta_string(), salt);

        let task = {
            let mut tasks = self.shared.tasks.write();
            if let Some(existing) = tasks.get(&id) {
                debug!(task_id = %id, job_name = %job_name, "task already live, not dispatching duplicate");
                return Ok(existing.clone());
            }
            let task = Task::new(
                id.clone(),
                job_name,
                job,
                Box::new(meta),
                Arc::downgrade(&self.shared),
            );
            tasks.insert(id, task.clone());
            task
        };

        let pool = pool.unwrap_or(&self.shared.global);
        if let Err(err) = pool.queue_task(&task) {
            self.shared.unindex_task(&task);
            task.abandon();
            return Err(err);
        }
        Ok(task)
    }

    /// Creates a pool for a group of tasks.
    ///
    /// With `created_by`, the pool becomes that task's child pool: its parent
    /// is the task's pool and it is cancelled with the task. With `replace`,
    /// a replacement worker runs until [`Pool::signal_all_queued`], so a
    /// handler can queue a large batch without starving the pool.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ShuttingDown`] while the pool stops, or
    /// [`SchedulerError::Internal`] if the replacement cannot be spawned.
    pub fn new_task_pool(
        &self,
        replace: bool,
        created_by: Option<&Task>,
    ) -> Result<Pool, SchedulerError> {
        if self.shared.is_shutting_down() {
            return Err(SchedulerError::ShuttingDown);
        }
        let (parent, token) = match created_by {
            Some(task) => (task.pool(), task.cancel_token().child()),
            None => (None, self.shared.root_token.child()),
        };
        let pool = Pool::nested(parent, created_by, token, Arc::downgrade(&self.shared));

        if replace {
            self.shared.add_replacement()?;
            pool.set_queue_thread();
        }
        if let Some(task) = created_by {
            task.set_child_pool(&pool);
        }
        self.shared
            .pools
            .lock()
            .insert(pool.id().to_string(), pool.clone());
        debug!(
            pool_id = %pool.id(),
            created_by = created_by.map(Task::id),
            replace,
            "task pool created"
        );
        Ok(pool)
    }

    /// Live task by id.
    #[must_use]
    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.shared.tasks.read().get(id).cloned()
    }

    /// All live tasks.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.shared.tasks.read().values().cloned().collect()
    }

    /// Live tasks of one job.
    #[must_use]
    pub fn tasks_by_job_name(&self, job_name: &str) -> Vec<Task> {
        self.shared
            .tasks
            .read()
            .values()
            .filter(|task| task.job_name() == job_name)
            .cloned()
            .collect()
    }

    /// Live pool by id; the global pool answers to its own id.
    #[must_use]
    pub fn get_task_pool(&self, id: &str) -> Option<Pool> {
        if id == self.shared.global.id() {
            return Some(self.shared.global.clone());
        }
        self.shared.pools.lock().get(id).cloned()
    }

    /// A live pool created by a task of `job_name`.
    #[must_use]
    pub fn task_pool_by_job_name(&self, job_name: &str) -> Option<Pool> {
        self.shared
            .pools
            .lock()
            .values()
            .find(|pool| {
                pool.created_in_task()
                    .is_some_and(|task| task.job_name() == job_name)
            })
            .cloned()
    }

    /// The pool that ungrouped tasks are queued on.
    #[must_use]
    pub fn global_pool(&self) -> Pool {
        self.shared.global.clone()
    }

    /// Current queue and worker counters.
    #[must_use]
    pub fn status(&self) -> WorkerPoolStatus {
        self.shared.status()
    }

    /// Configuration the pool was built with.
    #[must_use]
    pub fn config(&self) -> &WorkerPoolConfig {
        self.shared.config()
    }

    /// Whether [`WorkerPool::run`] has been called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire) && !self.shared.is_shutting_down()
    }

    /// Whether [`WorkerPool::stop`] has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("status", &self.shared.status())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
