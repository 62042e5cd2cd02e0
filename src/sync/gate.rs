//! Close-once wait gate.
//!
//! A [`Gate`] starts open-for-waiting (closed to passage) and is released
//! exactly once. Every thread blocked on it, and every thread that arrives
//! later, passes straight through.
//!
//! # Examples
//!
//! ```
//! use vault_scheduler::sync::Gate;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let gate = Arc::new(Gate::new());
//! let waiter = {
//!     let gate = Arc::clone(&gate);
//!     thread::spawn(move || gate.wait())
//! };
//!
//! assert!(gate.close());
//! assert!(!gate.close());
//! waiter.join().unwrap();
//! ```

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

/// A gate that is closed exactly once and then lets every waiter through.
#[derive(Debug)]
pub struct Gate {
    /// Dropping the sender disconnects the channel, which is the release signal.
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl Gate {
    /// Creates a gate that has not been released yet.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    /// Releases the gate.
    ///
    /// Returns `true` only for the call that actually released it; every
    /// later call is a no-op returning `false`.
    pub fn close(&self) -> bool {
        self.sender.lock().take().is_some()
    }

    /// Whether the gate has been released.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Blocks until the gate is released.
    pub fn wait(&self) {
        // Nothing is ever sent, so recv only returns once the sender is gone.
        let _ = self.receiver.recv();
    }

    /// Blocks until the gate is released or `timeout` elapses.
    ///
    /// Returns `true` if the gate was released.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    /// Receiver that disconnects when the gate is released, for use in `select!`.
    #[must_use]
    pub const fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_gate_starts_open_for_waiting() {
        let gate = Gate::new();
        assert!(!gate.is_closed());
        assert!(!gate.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_gate_closes_once() {
        let gate = Gate::new();
        assert!(gate.close());
        assert!(gate.is_closed());
        assert!(!gate.close());
        assert!(gate.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_gate_releases_all_waiters() {
        let gate = Arc::new(Gate::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            handles.push(thread::spawn(move || gate.wait()));
        }

        thread::sleep(Duration::from_millis(10));
        gate.close();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_gate_receiver_in_select() {
        let gate = Gate::new();
        let (_tx, other) = crossbeam_channel::unbounded::<()>();
        gate.close();

        let released = crossbeam_channel::select! {
            recv(gate.receiver()) -> _ => true,
            recv(other) -> _ => false,
        };
        assert!(released);
    }
}
