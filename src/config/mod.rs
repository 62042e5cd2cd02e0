//! Configuration models for the worker pool.

pub mod worker_pool;

pub use worker_pool::WorkerPoolConfig;
