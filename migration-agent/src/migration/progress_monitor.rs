//! §4.3: the progress monitor. Periodically samples hypervisor job info,
//! tracks the smallest `dataRemaining` seen (the "lowmark"), and forces an
//! abort when the transfer overruns its wall-clock budget or stalls for too
//! long. Exposes a 0-99/100 progress percentage for status queries.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::collaborators::HypervisorDomain;

/// `calc(remaining, total)` from §4.3's progress-exposure rule:
/// * `remaining == 0` -> 100
/// * else `100 - 100*remaining/total` when `total > 0`, else 0
/// * clamp to 99 when the result would be >= 100 (it can't reach 100 here
///   since `remaining == 0` is handled above, but integer rounding with a
///   tiny `remaining` can still round up to 100).
pub fn calc(remaining: u64, total: u64) -> u8 {
    if remaining == 0 {
        return 100;
    }
    if total == 0 {
        return 0;
    }
    let p = 100u64.saturating_sub(100 * remaining / total);
    if p >= 100 {
        99
    } else {
        p as u8
    }
}

/// Shared, lock-free progress value the driver's `getStat` reads while the
/// monitor runs concurrently (§5 "a data race on progress is tolerable").
#[derive(Clone)]
pub struct ProgressHandle {
    progress: Arc<AtomicU8>,
}

impl ProgressHandle {
    fn new() -> Self {
        Self {
            progress: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn get(&self) -> u8 {
        self.progress.load(Ordering::Relaxed)
    }

    fn set(&self, value: u8) {
        self.progress.store(value, Ordering::Relaxed);
    }
}

/// Spawns the progress monitor as a detached task. `start_time` anchors both
/// the wall-clock overrun check and the initial `lastProgressTime`. `cancel`
/// is the token shared by both background workers (§5 Ordering #1).
pub fn spawn(
    domain: Arc<dyn HypervisorDomain>,
    interval: Duration,
    start_time: Instant,
    mem_mib: u64,
    max_time_per_gib_mem_secs: u64,
    progress_timeout: Duration,
    cancel: CancellationToken,
) -> ProgressMonitorHandle {
    let task_cancel = cancel.clone();
    let progress = ProgressHandle::new();
    let task_progress = progress.clone();
    let task_domain = domain.clone();

    let handle = tokio::spawn(async move {
        run(
            task_domain,
            interval,
            start_time,
            mem_mib,
            max_time_per_gib_mem_secs,
            progress_timeout,
            task_progress,
            task_cancel,
        )
        .await;
    });

    ProgressMonitorHandle {
        cancel,
        progress,
        handle: Some(handle),
    }
}

async fn run(
    domain: Arc<dyn HypervisorDomain>,
    interval: Duration,
    start_time: Instant,
    mem_mib: u64,
    max_time_per_gib_mem_secs: u64,
    progress_timeout: Duration,
    progress: ProgressHandle,
    cancel: CancellationToken,
) {
    debug!("migration progress monitor started");

    // Ceiling division, per §4.3: the gate is on the *computed* budget being
    // nonzero, not on the config knob being nonzero — a small enough guest
    // would otherwise floor-divide to a zero budget and abort instantly.
    let migration_max_time_secs = (max_time_per_gib_mem_secs * mem_mib + 1023) / 1024;
    let migration_max_time = if migration_max_time_secs > 0 {
        Some(Duration::from_secs(migration_max_time_secs))
    } else {
        None
    };

    let mut lowmark: Option<u64> = None;
    let mut last_progress_time = start_time;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("migration progress monitor stopped");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let job = match domain.job_info().await {
            Ok(job) => job,
            Err(err) => {
                warn!(%err, "failed to sample migration job info");
                continue;
            }
        };

        let now = Instant::now();
        let mut abort = false;

        if let Some(budget) = migration_max_time {
            if now.duration_since(start_time) > budget {
                warn!(
                    elapsed_secs = now.duration_since(start_time).as_secs(),
                    budget_secs = budget.as_secs(),
                    "migration exceeded its configured maximum time, aborting"
                );
                abort = true;
            }
        }

        if !abort {
            match lowmark {
                None => {
                    lowmark = Some(job.data_remaining);
                    last_progress_time = now;
                }
                Some(mark) if job.data_remaining < mark => {
                    lowmark = Some(job.data_remaining);
                    last_progress_time = now;
                }
                Some(_) if now.duration_since(last_progress_time) > progress_timeout => {
                    warn!(
                        stalled_secs = now.duration_since(last_progress_time).as_secs(),
                        "migration hasn't progressed, aborting"
                    );
                    abort = true;
                }
                Some(_) => {}
            }
        }

        if abort {
            if let Err(err) = domain.abort_job().await {
                warn!(%err, "failed to abort stalled/overrunning migration job");
            }
            return;
        }

        if let Some(mark) = lowmark {
            if job.data_remaining > mark {
                warn!(
                    remaining = job.data_remaining,
                    lowmark = mark,
                    "migration stalling: remaining exceeds lowmark"
                );
            }
        }

        if job.job_type == 0 {
            continue;
        }

        let pct = calc(job.data_remaining, job.data_total);
        progress.set(pct);
        info!(
            elapsed_ms = job.time_elapsed_ms,
            percent = pct,
            "migration progress"
        );
    }
}

/// Owns the monitor task's cancellation, join handle, and the shared
/// progress value the driver reads via `getStat`.
pub struct ProgressMonitorHandle {
    cancel: CancellationToken,
    progress: ProgressHandle,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl ProgressMonitorHandle {
    pub fn progress(&self) -> u8 {
        self.progress.get()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ProgressMonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
