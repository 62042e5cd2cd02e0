//! Tests for error types

use vault_scheduler::core::{SchedulerError, TaskError, TaskExit};

#[test]
fn test_pool_closed_error() {
    let err = SchedulerError::PoolClosed("p1".to_string());
    assert_eq!(format!("{err}"), "attempting to add task to closed task pool p1");
}

#[test]
fn test_unregistered_job_error() {
    let err = SchedulerError::UnregisteredJob("scan".to_string());
    assert_eq!(format!("{err}"), "trying to dispatch non-registered job: scan");
}

#[test]
fn test_previously_failed_error() {
    let err = SchedulerError::PreviouslyFailed("abc".to_string());
    assert_eq!(
        format!("{err}"),
        "not re-queueing task abc that has an error set"
    );
}

#[test]
fn test_task_errors() {
    assert_eq!(TaskError::failed(anyhow::anyhow!("disk full")).to_string(), "disk full");
    assert_eq!(
        TaskError::Panicked("oops".to_string()).to_string(),
        "task panicked: oops"
    );
    assert!(TaskError::Timeout.is_timeout());
}

#[test]
fn test_task_exit_survives_anyhow() {
    let err: anyhow::Error = TaskExit.into();
    assert!(err.is::<TaskExit>());
    let wrapped = err.context("while scanning");
    assert!(wrapped.downcast_ref::<TaskExit>().is_some());
}
