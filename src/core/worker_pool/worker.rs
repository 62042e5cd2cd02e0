//! Worker thread loop.

use std::cell::Cell;
use std::sync::atomic::Ordering;

use crossbeam_channel::{after, select};
use tracing::{debug, warn};

use super::Shared;
use crate::core::events::{build_event, EventKind};
use crate::core::task::Task;

thread_local! {
    /// Address of the [`Shared`] whose worker loop owns this thread.
    static OWNER: Cell<usize> = const { Cell::new(0) };
}

fn address(shared: &Shared) -> usize {
    std::ptr::from_ref(shared) as usize
}

/// Whether the calling thread is one of `shared`'s workers.
pub(super) fn is_worker_of(shared: &Shared) -> bool {
    OWNER.with(|owner| owner.get() == address(shared))
}

/// Body of a worker thread.
///
/// Replacement workers also wake every idle-check period and exit as soon
/// as they are surplus. After handing work back they pause for one idle-check
/// period before dequeuing again.
pub(super) fn run(shared: &Shared, worker_id: usize, replacement: bool) {
    debug!(worker_id, replacement, "worker thread started");
    OWNER.with(|owner| owner.set(address(shared)));
    let idle_check = shared.config().replacement_idle_check();

    loop {
        let task = if replacement {
            select! {
                recv(shared.shutdown_signal()) -> _ => break,
                recv(shared.queue_rx) -> msg => match msg {
                    Ok(task) => task,
                    Err(_) => break,
                },
                default(idle_check) => {
                    if shared.try_retire() {
                        debug!(worker_id, "idle replacement worker retiring");
                        return;
                    }
                    continue;
                }
            }
        } else {
            select! {
                recv(shared.shutdown_signal()) -> _ => break,
                recv(shared.queue_rx) -> msg => match msg {
                    Ok(task) => task,
                    Err(_) => break,
                },
            }
        };

        if shared.is_shutting_down() {
            task.abandon();
            break;
        }

        let task = if replacement && !task.options().allow_replacement {
            match defer(shared, task) {
                Some(task) => task,
                None => {
                    if shared.try_retire() {
                        debug!(worker_id, "surplus replacement worker retiring");
                        return;
                    }
                    // Nothing this worker may run is known to be queued.
                    select! {
                        recv(shared.shutdown_signal()) -> _ => break,
                        recv(after(idle_check)) -> _ => continue,
                    }
                }
            }
        } else {
            task
        };

        execute(shared, worker_id, &task);

        if replacement && shared.try_retire() {
            debug!(worker_id, "replacement worker retiring");
            return;
        }
    }

    shared.alive.fetch_sub(1, Ordering::AcqRel);
    debug!(worker_id, "worker thread exiting");
}

/// Keeps a non-replaceable task away from a replacement worker.
///
/// With plenty of free queue space the task goes straight back on the
/// queue. Otherwise the run of non-replaceable tasks at the head of the
/// queue is moved to the retry buffer, and the first task this worker may
/// run, if any, is returned.
fn defer(shared: &Shared, task: Task) -> Option<Task> {
    let capacity = shared.config().effective_queue_capacity();
    let free = capacity.saturating_sub(shared.queue_len());
    let alive = shared.alive.load(Ordering::Acquire);

    if !shared.queue_rx.is_empty() && free > alive.saturating_mul(2) {
        shared.requeue(task);
        return None;
    }

    let mut deferred = vec![task];
    let mut runnable = None;
    while let Ok(next) = shared.queue_rx.try_recv() {
        if next.options().allow_replacement {
            runnable = Some(next);
            break;
        }
        deferred.push(next);
    }
    shared.defer_to_backlog(deferred);
    runnable
}

/// Runs one task and does all of its completion bookkeeping.
fn execute(shared: &Shared, worker_id: usize, task: &Task) {
    let Some(pool) = task.pool() else {
        warn!(task_id = %task.id(), "dequeued task has no live pool, dropping it");
        shared.unindex_task(task);
        task.abandon();
        return;
    };

    shared.mark_busy();
    if task.begin(worker_id) {
        debug!(
            worker_id,
            task_id = %task.id(),
            job_name = %task.job_name(),
            pool_id = %pool.id(),
            "task started"
        );
        shared.emit(|| {
            build_event(
                EventKind::TaskStarted,
                pool.id(),
                Some((task.id(), task.job_name())),
                None,
            )
        });
        task.execute();
    } else {
        debug!(worker_id, task_id = %task.id(), "skipping task cancelled before it started");
    }

    let finished = task.seal();
    shared.mark_idle();
    let exit_status = finished.exit_status;

    task.run_hooks(finished);

    if !task.options().persistent {
        shared.unindex_task(task);
    }
    debug!(
        worker_id,
        task_id = %task.id(),
        exit_status = %exit_status,
        exe_time = ?task.exe_time(),
        "task complete"
    );
    shared.emit(|| {
        build_event(
            EventKind::TaskComplete,
            pool.id(),
            Some((task.id(), task.job_name())),
            Some(shared.final_report(task, &task.get_results(), exit_status)),
        )
    });
    task.release_waiters();

    pool.handle_task_exit(task, exit_status);
    task.retire();
}
