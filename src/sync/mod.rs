//! Wait gates and cooperative cancellation.
//!
//! Both primitives are built on `crossbeam-channel` receivers whose sender is
//! dropped exactly once, so any number of threads can block on them, alone or
//! inside a `select!` with other channels, and all of them wake together.

pub mod cancel;
pub mod gate;

pub use cancel::CancelToken;
pub use gate::Gate;
