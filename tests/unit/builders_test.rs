//! Tests for builder modules

use std::sync::Arc;

use vault_scheduler::builders::WorkerPoolBuilder;
use vault_scheduler::config::WorkerPoolConfig;
use vault_scheduler::core::{
    EventSink, InMemoryEventSink, JobOptions, JobResult, SchedulerError, Task,
};

fn noop(_: &Task) -> JobResult {
    Ok(())
}

#[test]
fn test_worker_pool_builder_build_does_not_start() {
    let pool = WorkerPoolBuilder::new(WorkerPoolConfig::new().with_worker_count(2))
        .job("noop", noop, JobOptions::default())
        .event_sink(Arc::new(InMemoryEventSink::new(8)) as Arc<dyn EventSink>)
        .build()
        .unwrap();

    assert!(!pool.is_running());
    assert_eq!(pool.config().worker_count, 2);
    assert_eq!(pool.status().alive, 0);
    pool.run().unwrap();
    assert!(pool.is_running());
    assert_eq!(pool.status().alive, 2);
    pool.stop();
}

#[test]
fn test_worker_pool_builder_rejects_invalid_config() {
    let err = WorkerPoolBuilder::new(WorkerPoolConfig::new().with_worker_count(0))
        .job("noop", noop, JobOptions::default())
        .start()
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidConfig(msg) if msg.contains("worker_count")));
}
