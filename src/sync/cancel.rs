//! Hierarchical cooperative cancellation.
//!
//! A [`CancelToken`] is cancelled at most once. Cancelling a token cancels
//! every token derived from it with [`CancelToken::child`], recursively.
//! Children never propagate upwards.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use super::Gate;

/// Children lists are pruned of dropped tokens whenever their length reaches
/// a power of two at or above this size.
const PRUNE_THRESHOLD: usize = 64;

#[derive(Debug, Default)]
struct Inner {
    gate: Gate,
    children: Mutex<Vec<Weak<Inner>>>,
}

/// Cloneable handle to a cancellation scope.
///
/// # Examples
///
/// ```
/// use vault_scheduler::sync::CancelToken;
///
/// let root = CancelToken::new();
/// let child = root.child();
/// let grandchild = child.child();
///
/// child.cancel();
/// assert!(!root.is_cancelled());
/// assert!(grandchild.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Creates a new root token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives a token that is cancelled whenever this one is.
    ///
    /// Deriving from an already-cancelled token yields a cancelled token.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();

        let mut children = self.inner.children.lock();
        // Checked under the children lock: `cancel` releases the gate before
        // taking this lock, so a child is either seen by `cancel` or sees it.
        if self.is_cancelled() {
            drop(children);
            child.cancel();
            return child;
        }

        if children.len() >= PRUNE_THRESHOLD && children.len().is_power_of_two() {
            children.retain(|weak| weak.strong_count() > 0);
        }
        children.push(Arc::downgrade(&child.inner));
        child
    }

    /// Cancels this token and all tokens derived from it.
    ///
    /// Idempotent; returns `true` for the call that performed the cancellation.
    pub fn cancel(&self) -> bool {
        if !self.inner.gate.close() {
            return false;
        }

        let children = std::mem::take(&mut *self.inner.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            Self { inner: child }.cancel();
        }
        true
    }

    /// Whether this token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.gate.is_closed()
    }

    /// Blocks until the token is cancelled.
    pub fn wait(&self) {
        self.inner.gate.wait();
    }

    /// Blocks until the token is cancelled or `timeout` elapses.
    ///
    /// Returns `true` if the token was cancelled.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.inner.gate.wait_timeout(timeout)
    }

    /// Receiver that disconnects on cancellation, for use in `select!`.
    #[must_use]
    pub fn done(&self) -> &Receiver<()> {
        self.inner.gate.receiver()
    }

    /// Whether both handles refer to the same cancellation scope.
    #[must_use]
    pub fn same_scope(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancelToken::new();
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_cascades_down_not_up() {
        let root = CancelToken::new();
        let child = root.child();
        let sibling = root.child();
        let grandchild = child.child();

        child.cancel();

        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(!sibling.is_cancelled());
        assert!(!root.is_cancelled());

        root.cancel();
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_token_is_cancelled() {
        let root = CancelToken::new();
        root.cancel();
        assert!(root.child().is_cancelled());
    }

    #[test]
    fn test_dropped_children_are_pruned() {
        let root = CancelToken::new();
        for _ in 0..1000 {
            let _ = root.child();
        }
        let kept = root.child();
        assert!(root.inner.children.lock().len() < 1000);

        root.cancel();
        assert!(kept.is_cancelled());
    }

    #[test]
    fn test_wait_wakes_on_cancel() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            thread::spawn(move || token.wait())
        };

        thread::sleep(Duration::from_millis(10));
        token.cancel();
        waiter.join().unwrap();
        assert!(token.wait_timeout(Duration::from_millis(1)));
    }
}
