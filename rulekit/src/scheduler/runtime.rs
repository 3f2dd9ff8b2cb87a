//! Scheduler backed by the tokio runtime.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{AtomicJobState, Clock, Job, JobState, Scheduler, SchedulerError};
use crate::tracing::prelude::*;

/// Deadlines further out than this are clamped. Adding it to any live
/// `Instant` cannot overflow; tokio uses the same horizon for its own
/// far-future sleeps.
const MAX_DELAY: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Runs each job as a tokio task that sleeps until its deadline.
///
/// Wall-clock time is derived from [`tokio::time::Instant`] relative to the
/// moment the scheduler was created, so the scheduler follows tokio's paused
/// clock in tests and is immune to wall-clock jumps once running.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    runtime: Handle,
    origin: Instant,
    origin_wall: OffsetDateTime,
}

/// Handle to a job submitted to a [`TokioScheduler`].
///
/// Dropping the handle does not cancel the job.
#[derive(Debug, Clone)]
pub struct TokioJobHandle {
    shared: Arc<JobShared>,
}

#[derive(Debug)]
struct JobShared {
    state: AtomicJobState,
    deadline: watch::Sender<Instant>,
    cancel: CancellationToken,
}

impl TokioScheduler {
    /// Create a scheduler on the current tokio runtime.
    pub fn new() -> Result<Self, SchedulerError> {
        let runtime =
            Handle::try_current().map_err(|e| SchedulerError::NoRuntime(e.to_string()))?;
        Ok(Self::with_handle(runtime))
    }

    /// Create a scheduler that spawns its jobs onto `runtime`.
    pub fn with_handle(runtime: Handle) -> Self {
        // Local offset lookup can fail in multi-threaded processes; UTC keeps
        // the arithmetic correct, only log output is affected.
        let origin_wall =
            OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());

        Self {
            runtime,
            origin: Instant::now(),
            origin_wall,
        }
    }

    fn deadline(&self, at: OffsetDateTime) -> Instant {
        let now = Instant::now();
        let delay = Duration::try_from(at - self.wall_at(now)).unwrap_or(Duration::ZERO);
        now + delay.min(MAX_DELAY)
    }

    fn wall_at(&self, instant: Instant) -> OffsetDateTime {
        self.origin_wall + instant.duration_since(self.origin)
    }
}

impl Clock for TokioScheduler {
    fn now(&self) -> OffsetDateTime {
        self.wall_at(Instant::now())
    }
}

impl Scheduler for TokioScheduler {
    type Handle = TokioJobHandle;

    fn schedule(&self, at: OffsetDateTime, job: Job) -> Result<Self::Handle, SchedulerError> {
        let (deadline_tx, deadline_rx) = watch::channel(self.deadline(at));
        let shared = Arc::new(JobShared {
            state: AtomicJobState::new(),
            deadline: deadline_tx,
            cancel: CancellationToken::new(),
        });

        self.runtime
            .spawn(run_job(Arc::clone(&shared), deadline_rx, job));

        Ok(TokioJobHandle { shared })
    }

    fn cancel(&self, handle: &Self::Handle) -> bool {
        if handle.shared.state.finish(JobState::Cancelled) {
            handle.shared.cancel.cancel();
            true
        } else {
            false
        }
    }

    fn reschedule(&self, handle: &Self::Handle, at: OffsetDateTime) -> bool {
        let deadline = self.deadline(at);
        // The state is read under the channel's write lock, which `run_job`
        // holds shared while it commits to firing.
        handle.shared.deadline.send_if_modified(|current| {
            if handle.shared.state.get() != JobState::Pending {
                return false;
            }
            *current = deadline;
            true
        })
    }

    fn has_fired(&self, handle: &Self::Handle) -> bool {
        handle.shared.state.get() == JobState::Fired
    }
}

async fn run_job(shared: Arc<JobShared>, mut deadline_rx: watch::Receiver<Instant>, job: Job) {
    let won = loop {
        let deadline = *deadline_rx.borrow_and_update();

        tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => {
                trace!("Scheduled job cancelled");
                return;
            }

            changed = deadline_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }

            _ = tokio::time::sleep_until(deadline) => {}
        }

        // A reschedule that landed while the sleep was completing wins.
        let current = deadline_rx.borrow();
        if current.has_changed() {
            continue;
        }
        let won = shared.state.finish(JobState::Fired);
        drop(current);
        break won;
    };

    if won {
        job();
    } else {
        trace!("Scheduled job lost race with cancel");
    }
}
