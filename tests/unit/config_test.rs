//! Tests for configuration validation and loading

use std::time::Duration;

use vault_scheduler::config::worker_pool::{
    ENV_DRAIN_INTERVAL_MS, ENV_QUEUE_CAPACITY, ENV_STATUS_MAX_INTERVAL_MS, ENV_WORKERS,
};
use vault_scheduler::config::WorkerPoolConfig;

#[test]
fn test_worker_pool_config_validation() {
    let valid = WorkerPoolConfig::new()
        .with_worker_count(4)
        .with_queue_capacity(16)
        .with_drain_interval_ms(100);
    assert!(valid.validate().is_ok());
    assert_eq!(valid.effective_queue_capacity(), 16);
    assert_eq!(valid.drain_interval(), Duration::from_millis(100));
}

#[test]
fn test_worker_pool_config_invalid_worker_count() {
    let invalid = WorkerPoolConfig::new().with_worker_count(0);
    assert!(invalid.validate().unwrap_err().contains("worker_count"));
}

#[test]
fn test_worker_pool_config_invalid_queue_capacity() {
    let invalid = WorkerPoolConfig::new().with_queue_capacity(0);
    assert!(invalid.validate().unwrap_err().contains("queue_capacity"));
}

#[test]
fn test_worker_pool_config_invalid_intervals() {
    let drain = WorkerPoolConfig::new().with_drain_interval_ms(0);
    assert!(drain.validate().is_err());

    let idle = WorkerPoolConfig::new().with_replacement_idle_check_ms(0);
    assert!(idle.validate().is_err());

    let stack = WorkerPoolConfig::new().with_thread_stack_size(1024);
    assert!(stack.validate().is_err());
}

#[test]
fn test_worker_pool_config_from_json() {
    let json = r#"{
        "worker_count": 3,
        "queue_capacity": 12,
        "drain_interval_ms": 250,
        "thread_name_prefix": "vault-test"
    }"#;

    let config = WorkerPoolConfig::from_json_str(json).unwrap();
    assert_eq!(config.worker_count, 3);
    assert_eq!(config.effective_queue_capacity(), 12);
    assert_eq!(config.drain_interval_ms, 250);
    assert_eq!(config.thread_name_prefix, "vault-test");
    assert_eq!(
        config.status_max_interval_ms,
        WorkerPoolConfig::default().status_max_interval_ms
    );
}

#[test]
fn test_worker_pool_config_from_json_rejects_invalid() {
    assert!(WorkerPoolConfig::from_json_str(r#"{"worker_count": 0}"#).is_err());
    assert!(WorkerPoolConfig::from_json_str("not json")
        .unwrap_err()
        .starts_with("parse error"));
}

#[test]
fn test_worker_pool_config_round_trips_through_json() {
    let config = WorkerPoolConfig::new()
        .with_worker_count(2)
        .with_status_interval_ms(200, 2_000);
    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(WorkerPoolConfig::from_json_str(&json).unwrap(), config);
}

#[test]
fn test_worker_pool_config_from_env() {
    std::env::set_var(ENV_WORKERS, "3");
    std::env::set_var(ENV_QUEUE_CAPACITY, "30");
    std::env::set_var(ENV_DRAIN_INTERVAL_MS, "75");
    std::env::set_var(ENV_STATUS_MAX_INTERVAL_MS, "500");

    let config = WorkerPoolConfig::from_env().unwrap();
    assert_eq!(config.worker_count, 3);
    assert_eq!(config.queue_capacity, Some(30));
    assert_eq!(config.drain_interval_ms, 75);
    assert_eq!(config.status_max_interval_ms, 500);
    assert!(config.status_min_interval_ms <= 500);

    std::env::set_var(ENV_WORKERS, "many");
    let err = WorkerPoolConfig::from_env().unwrap_err();
    assert!(err.contains(ENV_WORKERS));

    for name in [
        ENV_WORKERS,
        ENV_QUEUE_CAPACITY,
        ENV_DRAIN_INTERVAL_MS,
        ENV_STATUS_MAX_INTERVAL_MS,
    ] {
        std::env::remove_var(name);
    }
}
