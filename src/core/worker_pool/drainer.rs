//! Retry buffer drainer.

use crossbeam_channel::{select, tick};
use tracing::debug;

use super::Shared;

/// Every drain interval, moves buffered tasks into the queue, oldest first,
/// for as long as the queue has room.
pub(super) fn run(shared: &Shared) {
    let ticker = tick(shared.config().drain_interval());
    loop {
        select! {
            recv(shared.shutdown_signal()) -> _ => break,
            recv(ticker) -> _ => {
                let moved = shared.backlog.drain_into(&shared.queue_tx);
                if moved > 0 {
                    debug!(moved, remaining = shared.backlog.len(), "drained retry buffer");
                }
            }
        }
    }
    debug!("drainer exiting");
}
