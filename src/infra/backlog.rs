//! Overflow buffer in front of the bounded work queue.
//!
//! Submitting never blocks: when the queue is full, or the buffer already
//! holds items, new items go to the back of the buffer. A drainer later moves
//! them, in order, into the queue as capacity frees up.

use std::collections::VecDeque;

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;

/// Where an offered item ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Sent straight to the queue.
    Queued,
    /// Parked in the retry buffer.
    Buffered,
}

/// FIFO retry buffer draining into a bounded channel.
#[derive(Debug)]
pub struct Backlog<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Default for Backlog<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> Backlog<T> {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `item` to `queue`, or buffers it if the queue is full or the
    /// buffer is non-empty.
    ///
    /// The buffer lock is held across the send so a concurrent drain cannot
    /// reorder items.
    pub fn offer(&self, item: T, queue: &Sender<T>) -> Placement {
        let mut items = self.items.lock();
        if !items.is_empty() {
            items.push_back(item);
            return Placement::Buffered;
        }
        match queue.try_send(item) {
            Ok(()) => Placement::Queued,
            Err(TrySendError::Full(item) | TrySendError::Disconnected(item)) => {
                items.push_back(item);
                Placement::Buffered
            }
        }
    }

    /// Appends items to the back of the buffer.
    pub fn extend(&self, batch: impl IntoIterator<Item = T>) {
        self.items.lock().extend(batch);
    }

    /// Moves buffered items, oldest first, into `queue` until it is full.
    ///
    /// Returns how many items were moved.
    pub fn drain_into(&self, queue: &Sender<T>) -> usize {
        let mut items = self.items.lock();
        let mut moved = 0;
        while let Some(item) = items.pop_front() {
            match queue.try_send(item) {
                Ok(()) => moved += 1,
                Err(TrySendError::Full(item) | TrySendError::Disconnected(item)) => {
                    items.push_front(item);
                    break;
                }
            }
        }
        moved
    }

    /// Removes and returns everything in the buffer.
    pub fn take_all(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
