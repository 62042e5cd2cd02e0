//! Periodic status log.

use std::time::Duration;

use crossbeam_channel::{after, select};
use tracing::{debug, info};

use super::{Shared, WorkerPoolStatus};

/// Next polling interval: doubled up to `max` while nothing changes, back to
/// `min` on any change.
fn next_interval(current: Duration, changed: bool, min: Duration, max: Duration) -> Duration {
    if changed {
        min
    } else {
        current.saturating_mul(2).min(max)
    }
}

pub(super) fn run(shared: &Shared) {
    let min = Duration::from_millis(shared.config().status_min_interval_ms);
    let max = Duration::from_millis(shared.config().status_max_interval_ms);
    let mut interval = min;
    let mut last: Option<WorkerPoolStatus> = None;

    loop {
        select! {
            recv(shared.shutdown_signal()) -> _ => break,
            recv(after(interval)) -> _ => {}
        }

        let status = shared.status();
        let changed = last != Some(status);
        if changed {
            info!(
                queued = status.queued,
                buffered = status.buffered,
                busy = status.busy,
                alive = status.alive,
                target = status.target,
                deferred = status.deferred,
                lifetime_queued = status.lifetime_queued,
                "worker pool status"
            );
            last = Some(status);
        }
        interval = next_interval(interval, changed, min, max);
    }
    debug!("status reporter exiting");
}
