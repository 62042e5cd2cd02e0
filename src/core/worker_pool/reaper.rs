//! Deadline reaper.
//!
//! One thread owns every pending deadline in a min-heap and sleeps until the
//! earliest one. A fired hit is re-checked against the task's current
//! deadline, so hits for cleared or extended timeouts are no-ops.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;

use crossbeam_channel::{at, never, select};
use tracing::debug;

use super::Shared;
use crate::core::task::Task;

/// A deadline registered by [`Task::set_timeout`].
pub(crate) struct Hit {
    pub deadline: Instant,
    pub task: Task,
}

/// Heap entry ordered by deadline, then arrival.
struct Pending {
    deadline: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

pub(super) fn run(shared: &Shared) {
    debug!("reaper started");
    let mut heap: BinaryHeap<Reverse<Pending>> = BinaryHeap::new();
    let mut seq = 0_u64;

    loop {
        let timer = heap
            .peek()
            .map_or_else(never, |Reverse(next)| at(next.deadline));

        select! {
            recv(shared.shutdown_signal()) -> _ => break,
            recv(shared.hits_rx) -> msg => match msg {
                Ok(Hit { deadline, task }) => {
                    seq += 1;
                    heap.push(Reverse(Pending { deadline, seq, task }));
                }
                Err(_) => break,
            },
            recv(timer) -> _ => {
                let now = Instant::now();
                while heap.peek().is_some_and(|Reverse(next)| next.deadline <= now) {
                    if let Some(Reverse(due)) = heap.pop() {
                        if due.task.expire_if_due(now) {
                            debug!(task_id = %due.task.id(), "reaper expired task");
                        }
                    }
                }
            }
        }
    }

    debug!(pending = heap.len(), "reaper exiting");
}
