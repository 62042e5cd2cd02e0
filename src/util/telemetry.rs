//! Telemetry helpers for structured logging and tracing.

/// Install a default env-filtered fmt subscriber unless one is already set.
///
/// Scheduler log lines carry `task_id`, `job_name`, `pool_id` and
/// `worker_id` fields; filter them with `RUST_LOG`, for example
/// `RUST_LOG=vault_scheduler=debug`.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
