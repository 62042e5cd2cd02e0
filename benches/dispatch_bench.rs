//! Benchmarks for the vault scheduler.
//!
//! Benchmarks cover:
//! - Task id hashing
//! - Retry buffer offer and drain
//! - Dispatch-to-completion of a pool of tasks across worker counts
//! - Nested pools with supplemented waits
//! - Awaiting pools from a tokio runtime

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::time::Duration;

use crossbeam_channel::bounded;
use tokio::runtime::Runtime;
use vault_scheduler::builders::WorkerPoolBuilder;
use vault_scheduler::config::WorkerPoolConfig;
use vault_scheduler::core::{JobOptions, JobResult, Metadata, Task, WorkerPool};
use vault_scheduler::infra::Backlog;
use vault_scheduler::util::task_id;

// ============================================================================
// Bench Metadata and Jobs
// ============================================================================

#[derive(Debug)]
struct BenchMeta {
    job: &'static str,
    id: u64,
}

impl Metadata for BenchMeta {
    fn job_name(&self) -> &str {
        self.job
    }

    fn meta_string(&self) -> String {
        format!("{}:{}", self.job, self.id)
    }
}

fn noop(task: &Task) -> JobResult {
    black_box(task.id());
    Ok(())
}

fn fan_out(task: &Task) -> JobResult {
    let workers = task
        .worker_pool()
        .ok_or_else(|| anyhow::anyhow!("worker pool gone"))?;
    let children = workers.new_task_pool(false, Some(task))?;
    for id in 0..8 {
        workers.dispatch_job("noop", BenchMeta { job: "noop", id }, Some(&children))?;
    }
    children.signal_all_queued();
    children.wait(true, Some(task))?;
    Ok(())
}

fn bench_pool(workers: usize) -> WorkerPool {
    let config = WorkerPoolConfig::new()
        .with_worker_count(workers)
        .with_drain_interval_ms(1)
        .with_replacement_idle_check_ms(5);
    WorkerPoolBuilder::new(config)
        .job("noop", noop, JobOptions::new().with_unique(true))
        .job("fan_out", fan_out, JobOptions::new().with_unique(true))
        .start()
        .expect("bench pool starts")
}

fn run_batch(pool: &WorkerPool, job: &'static str, count: u64) {
    let group = pool.new_task_pool(false, None).expect("pool");
    for id in 0..count {
        pool.dispatch_job(job, BenchMeta { job, id }, Some(&group))
            .expect("dispatch");
    }
    group.signal_all_queued();
    group.wait(false, None).expect("wait");
}

// ============================================================================
// Hashing
// ============================================================================

fn bench_task_id(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_id");
    group.bench_function("plain", |b| {
        b.iter(|| task_id(black_box("scan_file:/photos/2024/IMG_0001.jpg"), None));
    });
    group.bench_function("salted", |b| {
        let mut seq = 0_u64;
        b.iter(|| {
            seq += 1;
            task_id(black_box("ingest:/photos"), Some((1, seq)))
        });
    });
    group.finish();
}

// ============================================================================
// Retry Buffer
// ============================================================================

fn bench_backlog(c: &mut Criterion) {
    let mut group = c.benchmark_group("backlog");
    for size in [64_usize, 1024] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("offer_then_drain", size), &size, |b, &size| {
            b.iter(|| {
                let (tx, rx) = bounded(size / 4);
                let backlog = Backlog::new();
                for i in 0..size {
                    black_box(backlog.offer(i, &tx));
                }
                let mut received = 0;
                while received < size {
                    received += rx.try_iter().count();
                    backlog.drain_into(&tx);
                }
                received
            });
        });
    }
    group.finish();
}

// ============================================================================
// End-to-End
// ============================================================================

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_to_completion");
    group.measurement_time(Duration::from_secs(5));
    for workers in [1_usize, 4, 8] {
        let pool = bench_pool(workers);
        group.throughput(Throughput::Elements(256));
        group.bench_with_input(BenchmarkId::new("workers", workers), &pool, |b, pool| {
            b.iter(|| run_batch(pool, "noop", 256));
        });
        pool.stop();
    }
    group.finish();
}

fn bench_nested(c: &mut Criterion) {
    let mut group = c.benchmark_group("nested_pools");
    let pool = bench_pool(2);
    group.throughput(Throughput::Elements(16 * 9));
    group.bench_function("fan_out_16x8", |b| {
        b.iter(|| run_batch(&pool, "fan_out", 16));
    });
    pool.stop();
    group.finish();
}

fn bench_async_wait(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let pool = bench_pool(4);
    c.bench_function("pool_wait_async_64", |b| {
        b.to_async(&rt).iter(|| async {
            let group = pool.new_task_pool(false, None).expect("pool");
            for id in 0..64 {
                pool.dispatch_job("noop", BenchMeta { job: "noop", id }, Some(&group))
                    .expect("dispatch");
            }
            group.signal_all_queued();
            group.wait_async().await.expect("wait");
        });
    });
    pool.stop();
}

criterion_group!(
    benches,
    bench_task_id,
    bench_backlog,
    bench_dispatch,
    bench_nested,
    bench_async_wait
);
criterion_main!(benches);
