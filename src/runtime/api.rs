//! Serializable views of tasks, pools, and the worker pool.
//!
//! These are what an HTTP or websocket layer hands to clients; they hold no
//! references back into the scheduler.

use serde::{Deserialize, Serialize};

use crate::core::{
    ExitStatus, Pool, PoolId, PoolStatus, QueueState, Task, TaskId, TaskResult, WorkerPool,
    WorkerPoolStatus,
};

/// Point-in-time view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task identifier.
    pub task_id: TaskId,
    /// Job the task runs.
    pub job_name: String,
    /// Lifecycle position.
    pub queue_state: QueueState,
    /// Outcome, if any.
    pub exit_status: ExitStatus,
    /// Pool the task was queued on.
    pub pool_id: Option<PoolId>,
    /// Metadata summary followed by the task's own results.
    pub result: TaskResult,
    /// Terminal error message.
    pub error: Option<String>,
    /// Milliseconds spent queued.
    pub queue_time_ms: u128,
    /// Milliseconds spent executing.
    pub exe_time_ms: u128,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        let mut result = task.metadata_result();
        result.extend(task.get_results());
        Self {
            task_id: task.id().to_string(),
            job_name: task.job_name().to_string(),
            queue_state: task.queue_state(),
            exit_status: task.exit_status(),
            pool_id: task.pool().map(|pool| pool.id().to_string()),
            result,
            error: task.read_error().map(|err| err.to_string()),
            queue_time_ms: task.queue_time().as_millis(),
            exe_time_ms: task.exe_time().as_millis(),
        }
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Pool identifier.
    pub pool_id: PoolId,
    /// Whether this is the global pool.
    pub global: bool,
    /// Parent pool id.
    pub parent_id: Option<PoolId>,
    /// Root pool id.
    pub root_id: PoolId,
    /// Task that created the pool.
    pub created_by: Option<TaskId>,
    /// No more tasks will be queued.
    pub all_queued: bool,
    /// The pool was cancelled.
    pub cancelled: bool,
    /// Counters and progress.
    pub status: PoolStatus,
    /// Ids of live child pools.
    pub children: Vec<PoolId>,
}

impl From<&Pool> for PoolSnapshot {
    fn from(pool: &Pool) -> Self {
        Self {
            pool_id: pool.id().to_string(),
            global: pool.is_global(),
            parent_id: pool.parent().map(|parent| parent.id().to_string()),
            root_id: pool.root().id().to_string(),
            created_by: pool.created_in_task().map(|task| task.id().to_string()),
            all_queued: pool.all_queued(),
            cancelled: pool.is_cancelled(),
            status: pool.status(),
            children: pool
                .children()
                .iter()
                .map(|child| child.id().to_string())
                .collect(),
        }
    }
}

/// Health response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Running with at least one live worker.
    pub ok: bool,
    /// Queue and worker counters.
    pub status: WorkerPoolStatus,
}

impl From<&WorkerPool> for Health {
    fn from(pool: &WorkerPool) -> Self {
        let status = pool.status();
        Self {
            ok: pool.is_running() && status.alive > 0,
            status,
        }
    }
}

/// Snapshots of every live task of `job_name`, or of all live tasks.
#[must_use]
pub fn task_snapshots(pool: &WorkerPool, job_name: Option<&str>) -> Vec<TaskSnapshot> {
    let tasks = match job_name {
        Some(name) => pool.tasks_by_job_name(name),
        None => pool.tasks(),
    };
    tasks.iter().map(TaskSnapshot::from).collect()
}
