//! One-shot delayed jobs.
//!
//! A [`Scheduler`] runs a closure once at (or shortly after) an absolute
//! time, and lets the submitter cancel or move the job before it runs. The
//! timer utilities in this crate are written against the trait so they can
//! run on tokio in production ([`TokioScheduler`]) and on a virtual clock in
//! tests ([`ManualScheduler`]).
//!
//! # Job lifecycle
//!
//! ```text
//!            schedule()
//!   ───────────────────► Pending ──── deadline reached ───► Fired
//!                         │   ▲
//!               cancel()  │   │ reschedule()
//!                         ▼   │
//!                    Cancelled └──
//! ```
//!
//! `Fired` and `Cancelled` are terminal. Exactly one of "the job ran" and
//! "`cancel` returned true" happens for every job.

mod manual;
mod runtime;

pub use manual::{ManualJobHandle, ManualScheduler};
pub use runtime::{TokioJobHandle, TokioScheduler};

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use time::OffsetDateTime;

/// Work submitted to a scheduler.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Errors from submitting a job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler has been shut down")]
    ShutDown,

    #[error("no async runtime available: {0}")]
    NoRuntime(String),
}

/// A source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Runs jobs once at an absolute time.
pub trait Scheduler: Clock + 'static {
    /// Ownership token for a submitted job.
    type Handle: Send + 'static;

    /// Submit `job` to run at `at`. Times in the past run as soon as
    /// possible.
    fn schedule(&self, at: OffsetDateTime, job: Job) -> Result<Self::Handle, SchedulerError>;

    /// Prevent the job from running. Returns `true` if this call stopped it,
    /// `false` if it already ran or was already cancelled.
    fn cancel(&self, handle: &Self::Handle) -> bool;

    /// Move a pending job to a new time. Returns `false` if the job is no
    /// longer pending.
    fn reschedule(&self, handle: &Self::Handle, at: OffsetDateTime) -> bool;

    /// Whether the job has run (or started running).
    fn has_fired(&self, handle: &Self::Handle) -> bool;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> OffsetDateTime {
        (**self).now()
    }
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    type Handle = S::Handle;

    fn schedule(&self, at: OffsetDateTime, job: Job) -> Result<Self::Handle, SchedulerError> {
        (**self).schedule(at, job)
    }

    fn cancel(&self, handle: &Self::Handle) -> bool {
        (**self).cancel(handle)
    }

    fn reschedule(&self, handle: &Self::Handle, at: OffsetDateTime) -> bool {
        (**self).reschedule(handle, at)
    }

    fn has_fired(&self, handle: &Self::Handle) -> bool {
        (**self).has_fired(handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum JobState {
    Pending = 0,
    Fired = 1,
    Cancelled = 2,
}

/// Job state shared between the submitter and whatever runs the job.
///
/// Transitions out of `Pending` are compare-and-swap, so a racing fire and
/// cancel agree on a single winner.
#[derive(Debug)]
pub(crate) struct AtomicJobState(AtomicU8);

impl AtomicJobState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(JobState::Pending as u8))
    }

    pub(crate) fn get(&self) -> JobState {
        match self.0.load(Ordering::Acquire) {
            0 => JobState::Pending,
            1 => JobState::Fired,
            _ => JobState::Cancelled,
        }
    }

    /// Leave `Pending` for `to`. Returns `false` if another transition won.
    pub(crate) fn finish(&self, to: JobState) -> bool {
        self.0
            .compare_exchange(
                JobState::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_transition_out_of_pending_wins() {
        let state = AtomicJobState::new();
        assert_eq!(state.get(), JobState::Pending);

        assert!(state.finish(JobState::Fired));
        assert!(!state.finish(JobState::Cancelled));
        assert_eq!(state.get(), JobState::Fired);
    }

    #[test]
    fn cancel_blocks_fire() {
        let state = AtomicJobState::new();

        assert!(state.finish(JobState::Cancelled));
        assert!(!state.finish(JobState::Fired));
        assert_eq!(state.get(), JobState::Cancelled);
    }
}
