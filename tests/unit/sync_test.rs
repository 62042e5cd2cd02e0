//! Tests for gates and cancellation tokens

use std::thread;
use std::time::Duration;

use crossbeam_channel::select;
use vault_scheduler::sync::{CancelToken, Gate};

#[test]
fn test_gate_releases_every_waiter() {
    let gate = std::sync::Arc::new(Gate::new());
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let gate = std::sync::Arc::clone(&gate);
            thread::spawn(move || gate.wait_timeout(Duration::from_secs(5)))
        })
        .collect();

    thread::sleep(Duration::from_millis(10));
    assert!(gate.close());
    assert!(!gate.close());
    assert!(gate.is_closed());
    for waiter in waiters {
        assert!(waiter.join().unwrap());
    }
}

#[test]
fn test_gate_wait_times_out_while_open() {
    let gate = Gate::new();
    assert!(!gate.wait_timeout(Duration::from_millis(5)));
}

#[test]
fn test_cancel_propagates_down_only() {
    let root = CancelToken::new();
    let child = root.child();
    let grandchild = child.child();
    let sibling = root.child();

    assert!(child.cancel());
    assert!(!child.cancel());
    assert!(grandchild.is_cancelled());
    assert!(!root.is_cancelled());
    assert!(!sibling.is_cancelled());

    root.cancel();
    assert!(sibling.is_cancelled());
}

#[test]
fn test_child_of_cancelled_token_starts_cancelled() {
    let root = CancelToken::new();
    root.cancel();
    assert!(root.child().is_cancelled());
}

#[test]
fn test_done_channel_in_select() {
    let token = CancelToken::new();
    let remote = token.clone();
    assert!(token.same_scope(&remote));

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        remote.cancel();
    });
    let cancelled = select! {
        recv(token.done()) -> _ => true,
        default(Duration::from_secs(5)) => false,
    };
    assert!(cancelled);
    canceller.join().unwrap();
}
