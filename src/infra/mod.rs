//! Infrastructure backing the worker pool's queueing.

pub mod backlog;

pub use backlog::{Backlog, Placement};
