//! Status views for HTTP layers and the async observer bridge.

pub mod api;
#[cfg(feature = "tokio-runtime")]
pub mod bridge;

pub use api::{task_snapshots, Health, PoolSnapshot, TaskSnapshot};
