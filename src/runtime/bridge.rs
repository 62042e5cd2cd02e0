//! Tokio bridge for observers running on an async runtime.
//!
//! The waits park a blocking-pool thread, never a runtime worker.

use std::time::Duration;

use tracing::warn;

use crate::core::{Pool, SchedulerError, Task};

impl Task {
    /// Async form of [`Task::wait`].
    pub async fn wait_async(&self) {
        let task = self.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || task.wait()).await {
            warn!(task_id = %self.id(), error = %err, "blocking task wait failed");
        }
    }

    /// Async form of [`Task::wait_timeout`].
    ///
    /// Returns `true` if the task exited within `timeout`.
    pub async fn wait_timeout_async(&self, timeout: Duration) -> bool {
        let task = self.clone();
        match tokio::task::spawn_blocking(move || task.wait_timeout(timeout)).await {
            Ok(exited) => exited,
            Err(err) => {
                warn!(task_id = %self.id(), error = %err, "blocking task wait failed");
                false
            }
        }
    }
}

impl Pool {
    /// Async form of [`Pool::wait`] for callers outside any task.
    ///
    /// # Errors
    ///
    /// Whatever [`Pool::wait`] returns, or [`SchedulerError::Internal`] if
    /// the blocking wait could not complete.
    pub async fn wait_async(&self) -> Result<(), SchedulerError> {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || pool.wait(false, None))
            .await
            .map_err(|err| SchedulerError::Internal(format!("pool wait failed: {err}")))?
    }
}
