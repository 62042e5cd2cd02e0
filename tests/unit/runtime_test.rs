//! Tests for runtime status views

use vault_scheduler::builders::WorkerPoolBuilder;
use vault_scheduler::config::WorkerPoolConfig;
use vault_scheduler::core::{JobOptions, JobResult, Metadata, Task};
use vault_scheduler::runtime::{task_snapshots, Health, PoolSnapshot, TaskSnapshot};

#[derive(Debug)]
struct Backup(&'static str);

impl Metadata for Backup {
    fn job_name(&self) -> &str {
        "backup"
    }

    fn meta_string(&self) -> String {
        format!("backup:{}", self.0)
    }
}

fn backup(task: &Task) -> JobResult {
    task.set_result([("files".to_string(), serde_json::Value::from(12))].into());
    Ok(())
}

#[test]
fn test_health_and_snapshots_of_running_pool() {
    let pool = WorkerPoolBuilder::new(WorkerPoolConfig::new().with_worker_count(1))
        .job("backup", backup, JobOptions::new().with_persistent(true))
        .start()
        .unwrap();

    let health = Health::from(&pool);
    assert!(health.ok);
    assert_eq!(health.status.alive, 1);

    let group = pool.new_task_pool(false, None).unwrap();
    let task = pool.dispatch_job("backup", Backup("nas"), Some(&group)).unwrap();
    group.signal_all_queued();
    group.wait(false, None).unwrap();

    let snap = TaskSnapshot::from(&task);
    assert_eq!(snap.result["files"], serde_json::json!(12));
    assert!(snap.error.is_none());
    let json = serde_json::to_value(&snap).unwrap();
    assert_eq!(json["exit_status"], "success");
    assert_eq!(json["queue_state"], "exited");

    // Persistent tasks remain listed after they exit.
    let listed = task_snapshots(&pool, None);
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].task_id, task.id());

    let pool_snap = PoolSnapshot::from(&group);
    assert_eq!(pool_snap.status.complete, 1);
    assert!(pool_snap.all_queued);

    pool.stop();
    assert!(!Health::from(&pool).ok);
}
