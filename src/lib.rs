//! # Vault Scheduler
//!
//! A hierarchical task scheduling engine for the vault file and photo server.
//!
//! Work is described by [`Metadata`](core::Metadata), executed by a
//! registered [`JobHandler`](core::JobHandler) on a fixed set of OS worker
//! threads, and grouped into nested [`Pool`](core::Pool)s whose completion,
//! errors, and cancellation propagate through the tree of dependent jobs.
//!
//! ## Core Problem Solved
//!
//! Scanning a library, backing it up to another instance, or generating
//! thumbnails all fan out: one task spawns a pool of sub-tasks, which may
//! spawn pools of their own, and the parent blocks until its children are
//! done. With a bounded number of worker threads that shape deadlocks as soon
//! as every worker is parked on a child pool. This crate keeps it moving:
//!
//! - **Replacement workers**: a handler that parks in [`Pool::wait`](core::Pool::wait)
//!   with `supplement = true` hands its slot to a transient thread, which
//!   retires once it is surplus.
//! - **Non-blocking dispatch**: a full queue spills into a retry buffer
//!   instead of blocking the submitter, so handlers can queue children freely.
//! - **Exactly-once completion**: whichever side observes `all queued` and
//!   `completed == total` first closes the pool, runs its cleanups, and
//!   removes it from the index.
//! - **Cascading cancellation** and a single **deadline reaper** thread.
//! - **Idempotent dispatch**: tasks are keyed by a hash of their metadata,
//!   and dispatching live work twice returns the existing task.
//!
//! ## Example
//!
//! ```no_run
//! use vault_scheduler::builders::WorkerPoolBuilder;
//! use vault_scheduler::config::WorkerPoolConfig;
//! use vault_scheduler::core::{JobOptions, JobResult, Metadata, Task};
//!
//! #[derive(Debug)]
//! struct ScanDir {
//!     path: String,
//! }
//!
//! impl Metadata for ScanDir {
//!     fn job_name(&self) -> &str {
//!         "scan_dir"
//!     }
//!     fn meta_string(&self) -> String {
//!         format!("scan_dir:{}", self.path)
//!     }
//! }
//!
//! fn scan_dir(task: &Task) -> JobResult {
//!     let path = task.with_metadata(|m: &ScanDir| m.path.clone())?;
//!     task.exit_if_signaled()?;
//!     task.set_result([("path".to_string(), serde_json::Value::from(path))].into());
//!     Ok(())
//! }
//!
//! let pool = WorkerPoolBuilder::new(WorkerPoolConfig::new().with_worker_count(4))
//!     .job("scan_dir", scan_dir, JobOptions::new().with_allow_replacement(false))
//!     .start()?;
//!
//! let task = pool.dispatch_job("scan_dir", ScanDir { path: "/photos".into() }, None)?;
//! task.wait();
//! println!("{:?}", task.get_results());
//! pool.stop();
//! # Ok::<(), vault_scheduler::core::SchedulerError>(())
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Tasks, pools, the worker pool, and their contracts.
pub mod core;
/// Worker pool configuration.
pub mod config;
/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Supporting data structures for the work queue.
pub mod infra;
/// Status views and the async observer bridge.
pub mod runtime;
/// Close-once gates and hierarchical cancellation.
pub mod sync;
/// Shared utilities.
pub mod util;
