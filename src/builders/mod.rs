//! Builders to construct scheduler components from configuration.

pub mod worker_pool_builder;

pub use worker_pool_builder::WorkerPoolBuilder;
