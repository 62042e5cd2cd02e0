pub mod clock;
pub mod hash;
pub mod telemetry;

pub use clock::*;
pub use hash::{short_hash, task_id};
pub use telemetry::*;
