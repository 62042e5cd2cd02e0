//! The contract every job provider implements, plus the identifiers and
//! result map shared by tasks and pools.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;

/// Stable task identifier derived from the metadata dedup string.
pub type TaskId = String;

/// Pool identifier, a v4 UUID for every pool except the global one.
pub type PoolId = String;

/// Identifier of the worker pool's global pool.
pub const GLOBAL_POOL_ID: &str = "GLOBAL";

/// String-keyed result map of arbitrary JSON values.
///
/// The scheduler never serializes this itself; notification layers convert it
/// to whatever wire format they need.
pub type TaskResult = HashMap<String, serde_json::Value>;

/// Description of one unit of work.
///
/// Implemented by every job provider. The worker pool stores the metadata on
/// the task, hands it to the handler through
/// [`Task::with_metadata`](crate::core::Task::with_metadata), and lets
/// external callers mutate it through
/// [`Task::manipulate`](crate::core::Task::manipulate).
///
/// # Examples
///
/// ```
/// use vault_scheduler::core::{Metadata, TaskResult};
///
/// #[derive(Debug)]
/// struct ScanFile {
///     path: String,
/// }
///
/// impl Metadata for ScanFile {
///     fn job_name(&self) -> &str {
///         "scan_file"
///     }
///
///     fn meta_string(&self) -> String {
///         format!("scan_file:{}", self.path)
///     }
///
///     fn format_to_result(&self) -> TaskResult {
///         TaskResult::from([("path".to_string(), serde_json::Value::from(self.path.clone()))])
///     }
///
///     fn verify(&self) -> anyhow::Result<()> {
///         anyhow::ensure!(!self.path.is_empty(), "path is empty");
///         Ok(())
///     }
/// }
///
/// let meta = ScanFile { path: "/photos/a.jpg".into() };
/// assert!(meta.verify().is_ok());
/// ```
pub trait Metadata: Any + Send + Sync + Debug {
    /// Name of the registered job this metadata belongs to.
    fn job_name(&self) -> &str;

    /// Deterministic string used for de-duplication.
    fn meta_string(&self) -> String;

    /// Renders the metadata into a result map for status reporting.
    fn format_to_result(&self) -> TaskResult {
        TaskResult::new()
    }

    /// Validates the metadata before a task is created for it.
    ///
    /// # Errors
    ///
    /// Returns the reason the metadata cannot be dispatched.
    fn verify(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
