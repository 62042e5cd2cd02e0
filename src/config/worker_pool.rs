//! Worker pool configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding [`WorkerPoolConfig::worker_count`].
pub const ENV_WORKERS: &str = "VAULT_WORKERS";
/// Environment variable overriding [`WorkerPoolConfig::queue_capacity`].
pub const ENV_QUEUE_CAPACITY: &str = "VAULT_QUEUE_CAPACITY";
/// Environment variable overriding [`WorkerPoolConfig::drain_interval_ms`].
pub const ENV_DRAIN_INTERVAL_MS: &str = "VAULT_DRAIN_INTERVAL_MS";
/// Environment variable overriding [`WorkerPoolConfig::status_max_interval_ms`].
pub const ENV_STATUS_MAX_INTERVAL_MS: &str = "VAULT_STATUS_MAX_INTERVAL_MS";

/// Central queue slots allotted per base worker when no capacity is configured.
pub const QUEUE_SLOTS_PER_WORKER: usize = 1000;

/// Configuration for a [`WorkerPool`](crate::core::WorkerPool).
///
/// # Examples
///
/// ```
/// use vault_scheduler::config::WorkerPoolConfig;
///
/// let config = WorkerPoolConfig::new()
///     .with_worker_count(4)
///     .with_drain_interval_ms(250);
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.effective_queue_capacity(), 4000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of base worker threads.
    pub worker_count: usize,
    /// Central queue capacity; `None` means `worker_count * 1000`.
    pub queue_capacity: Option<usize>,
    /// How often the retry buffer is drained back into the queue.
    pub drain_interval_ms: u64,
    /// Fastest status report interval, used right after a change.
    pub status_min_interval_ms: u64,
    /// Slowest status report interval, reached while nothing changes.
    pub status_max_interval_ms: u64,
    /// How long an idle replacement worker waits before checking whether it is surplus.
    pub replacement_idle_check_ms: u64,
    /// Per-thread join timeout during `stop`.
    pub shutdown_timeout_ms: u64,
    /// Stack size for worker threads.
    pub thread_stack_size: usize,
    /// Worker thread name prefix; threads are named `{prefix}-{worker_id}`.
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            queue_capacity: None,
            drain_interval_ms: 10_000,
            status_min_interval_ms: 1_000,
            status_max_interval_ms: 10_000,
            replacement_idle_check_ms: 50,
            shutdown_timeout_ms: 2_000,
            thread_stack_size: 2 * 1024 * 1024,
            thread_name_prefix: "vault-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    /// Default configuration sized to the host's CPU count.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of base worker threads.
    #[must_use]
    pub const fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set an explicit central queue capacity.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Set the retry buffer drain interval.
    #[must_use]
    pub const fn with_drain_interval_ms(mut self, ms: u64) -> Self {
        self.drain_interval_ms = ms;
        self
    }

    /// Set the status reporter's backoff bounds.
    #[must_use]
    pub const fn with_status_interval_ms(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.status_min_interval_ms = min_ms;
        self.status_max_interval_ms = max_ms;
        self
    }

    /// Set the idle check period for replacement workers.
    #[must_use]
    pub const fn with_replacement_idle_check_ms(mut self, ms: u64) -> Self {
        self.replacement_idle_check_ms = ms;
        self
    }

    /// Set the per-thread join timeout used by `stop`.
    #[must_use]
    pub const fn with_shutdown_timeout_ms(mut self, ms: u64) -> Self {
        self.shutdown_timeout_ms = ms;
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Queue capacity after applying the per-worker default.
    #[must_use]
    pub fn effective_queue_capacity(&self) -> usize {
        self.queue_capacity
            .unwrap_or_else(|| self.worker_count.saturating_mul(QUEUE_SLOTS_PER_WORKER))
    }

    /// Drain interval as a `Duration`.
    #[must_use]
    pub const fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    /// Replacement idle check period as a `Duration`.
    #[must_use]
    pub const fn replacement_idle_check(&self) -> Duration {
        Duration::from_millis(self.replacement_idle_check_ms)
    }

    /// Join timeout as a `Duration`.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.queue_capacity == Some(0) {
            return Err("queue_capacity must be greater than 0".into());
        }
        if self.drain_interval_ms == 0 {
            return Err("drain_interval_ms must be greater than 0".into());
        }
        if self.status_min_interval_ms == 0 {
            return Err("status_min_interval_ms must be greater than 0".into());
        }
        if self.status_max_interval_ms < self.status_min_interval_ms {
            return Err("status_max_interval_ms must not be below status_min_interval_ms".into());
        }
        if self.replacement_idle_check_ms == 0 {
            return Err("replacement_idle_check_ms must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from the environment, after loading `.env` if present.
    ///
    /// Reads `VAULT_WORKERS`, `VAULT_QUEUE_CAPACITY`, `VAULT_DRAIN_INTERVAL_MS`
    /// and `VAULT_STATUS_MAX_INTERVAL_MS`; anything unset keeps its default.
    ///
    /// # Errors
    ///
    /// Returns a message naming the variable that failed to parse, or the
    /// validation failure.
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();

        let mut cfg = Self::default();
        if let Some(workers) = env_var(ENV_WORKERS)? {
            cfg.worker_count = workers;
        }
        if let Some(capacity) = env_var(ENV_QUEUE_CAPACITY)? {
            cfg.queue_capacity = Some(capacity);
        }
        if let Some(ms) = env_var(ENV_DRAIN_INTERVAL_MS)? {
            cfg.drain_interval_ms = ms;
        }
        if let Some(ms) = env_var(ENV_STATUS_MAX_INTERVAL_MS)? {
            cfg.status_max_interval_ms = ms;
            cfg.status_min_interval_ms = cfg.status_min_interval_ms.min(ms);
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn env_var<T>(name: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| format!("invalid {name}: {e}")),
        Err(_) => Ok(None),
    }
}
