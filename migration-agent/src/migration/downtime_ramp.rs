//! §4.2: the downtime ramp. A fire-and-forget worker that steps the
//! hypervisor's max-allowed stop-the-world downtime from a small initial
//! value up to `target_downtime` in `N` equal increments, spread over a
//! memory-proportional window.
//!
//! Open Question 1: the source computes the window with integer division
//! `(delay_per_gib * max(mem_mib, 2048) + 1023) / 1024` and then treats that
//! total as a budget divided by `N` for each step's wait — it is an
//! approximate budget, not a precise schedule, and this implementation
//! preserves that rather than "fixing" the rounding.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::collaborators::HypervisorDomain;

/// Computes the total ramp window in milliseconds, per Open Question 1's
/// rounding (ceiling-divide by 1024, guarantee at least a 2 GiB floor).
pub fn ramp_window_ms(delay_per_gib_ms: u64, mem_mib: u64) -> u64 {
    let effective_mem = mem_mib.max(2048);
    (delay_per_gib_ms * effective_mem + 1023) / 1024
}

/// Spawns the downtime ramp as a detached task and returns a handle whose
/// drop stops it. `cancel` is the token shared by both background workers
/// (§5 Ordering #1); the driver cancels it unconditionally on return from
/// the underlying transfer (§4.1.c step 9). Lifetime is strictly contained
/// within the driver's transfer phase.
pub fn spawn(
    domain: Arc<dyn HypervisorDomain>,
    target_downtime_ms: u64,
    steps: u32,
    delay_per_gib_ms: u64,
    mem_mib: u64,
    cancel: CancellationToken,
) -> DowntimeRampHandle {
    let task_cancel = cancel.clone();

    let handle = tokio::spawn(async move {
        run(
            domain,
            target_downtime_ms,
            steps,
            delay_per_gib_ms,
            mem_mib,
            task_cancel,
        )
        .await;
    });

    DowntimeRampHandle {
        cancel,
        handle: Some(handle),
    }
}

async fn run(
    domain: Arc<dyn HypervisorDomain>,
    target_downtime_ms: u64,
    steps: u32,
    delay_per_gib_ms: u64,
    mem_mib: u64,
    cancel: CancellationToken,
) {
    if steps == 0 {
        return;
    }

    let window_ms = ramp_window_ms(delay_per_gib_ms, mem_mib);
    let per_step = Duration::from_millis(window_ms / steps as u64);

    debug!(window_ms, steps, "migration downtime ramp started");

    for i in 0..steps {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("migration downtime ramp cancelled");
                return;
            }
            _ = tokio::time::sleep(per_step) => {}
        }

        let downtime = target_downtime_ms * (i as u64 + 1) / steps as u64;
        debug!(downtime, "setting migration downtime");
        if let Err(err) = domain.set_max_downtime(downtime).await {
            debug!(%err, "failed to set migration downtime, ramp continuing");
        }
    }

    debug!("migration downtime ramp exiting");
}

/// Owns the ramp task's cancellation and join handle.
pub struct DowntimeRampHandle {
    cancel: CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl DowntimeRampHandle {
    /// Signals the worker to stop at its next wait checkpoint. Does not
    /// block; the worker exits on its own.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for DowntimeRampHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
