//! Core scheduling abstractions: tasks, pools, and the worker pool.

pub mod error;
pub mod events;
pub mod job;
pub mod metadata;
pub mod pool;
pub mod task;
pub mod worker_pool;

pub use error::{SchedulerError, TaskError, TaskExit};
pub use events::{build_event, EventKind, EventSink, InMemoryEventSink, LifecycleEvent};
pub use job::{JobHandler, JobOptions, JobResult};
pub use metadata::{Metadata, PoolId, TaskId, TaskResult, GLOBAL_POOL_ID};
pub use pool::{Pool, PoolCleanup, PoolStatus};
pub use task::{ExitStatus, PostAction, QueueState, Task, TaskCleanup};
pub use worker_pool::{WorkerPool, WorkerPoolStatus};
