//! Virtual-clock scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use slotmap::SlotMap;
use time::OffsetDateTime;

use super::{AtomicJobState, Clock, Job, JobState, Scheduler, SchedulerError};

slotmap::new_key_type! {
    struct JobKey;
}

/// Handle to a job submitted to a [`ManualScheduler`].
///
/// The handle shares the job's state, so it still answers
/// [`has_fired`](Scheduler::has_fired) after the scheduler has let go of the
/// job.
#[derive(Debug, Clone)]
pub struct ManualJobHandle {
    key: JobKey,
    state: Arc<AtomicJobState>,
}

/// A scheduler whose clock only moves when told to.
///
/// Jobs run synchronously on the thread calling [`advance`](Self::advance)
/// or [`advance_to`](Self::advance_to), in deadline order (submission order
/// breaks ties). Jobs may schedule further jobs; any that fall due before the
/// advance target run in the same call.
///
/// Intended for tests and simulations. Only pending jobs are held; a job is
/// forgotten as soon as it runs or is cancelled.
#[derive(Clone)]
pub struct ManualScheduler {
    inner: Arc<Mutex<State>>,
}

struct State {
    now: OffsetDateTime,
    next_seq: u64,
    jobs: SlotMap<JobKey, Entry>,
    /// Pending jobs by (deadline, submission order).
    queue: BTreeMap<(OffsetDateTime, u64), JobKey>,
    shut_down: bool,
}

struct Entry {
    at: OffsetDateTime,
    seq: u64,
    state: Arc<AtomicJobState>,
    job: Job,
}

impl State {
    fn remove(&mut self, key: JobKey) -> Option<Entry> {
        let entry = self.jobs.remove(key)?;
        self.queue.remove(&(entry.at, entry.seq));
        Some(entry)
    }
}

impl ManualScheduler {
    /// Create a scheduler whose clock reads `start`.
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                now: start,
                next_seq: 0,
                jobs: SlotMap::with_key(),
                queue: BTreeMap::new(),
                shut_down: false,
            })),
        }
    }

    /// Move the clock forward by `by`, running every job that falls due.
    /// Returns the number of jobs run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now() + by;
        self.advance_to(target)
    }

    /// Move the clock to `target`, running every job due at or before it.
    /// The clock never moves backwards. Returns the number of jobs run.
    pub fn advance_to(&self, target: OffsetDateTime) -> usize {
        let mut ran = 0;

        loop {
            let entry = {
                let mut state = self.inner.lock();

                let due = state
                    .queue
                    .first_key_value()
                    .filter(|((at, _), _)| *at <= target)
                    .map(|(_, key)| *key);

                let Some(entry) = due.and_then(|key| state.remove(key)) else {
                    if state.now < target {
                        state.now = target;
                    }
                    return ran;
                };

                if entry.at > state.now {
                    state.now = entry.at;
                }
                entry
            };

            // Run without the lock so the job can use the scheduler.
            if entry.state.finish(JobState::Fired) {
                (entry.job)();
                ran += 1;
            }
        }
    }

    /// Number of jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    /// Deadline of the next job to run, if any.
    pub fn next_deadline(&self) -> Option<OffsetDateTime> {
        self.inner
            .lock()
            .queue
            .first_key_value()
            .map(|((at, _), _)| *at)
    }

    /// Drop all pending jobs and refuse new ones.
    pub fn shutdown(&self) {
        let dropped: Vec<Entry> = {
            let mut state = self.inner.lock();
            state.shut_down = true;
            state.queue.clear();
            state.jobs.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &dropped {
            entry.state.finish(JobState::Cancelled);
        }
        // Jobs may own values whose destructors call back into the scheduler.
        drop(dropped);
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new(OffsetDateTime::UNIX_EPOCH)
    }
}

impl Clock for ManualScheduler {
    fn now(&self) -> OffsetDateTime {
        self.inner.lock().now
    }
}

impl Scheduler for ManualScheduler {
    type Handle = ManualJobHandle;

    fn schedule(&self, at: OffsetDateTime, job: Job) -> Result<Self::Handle, SchedulerError> {
        let mut state = self.inner.lock();
        if state.shut_down {
            return Err(SchedulerError::ShutDown);
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        let job_state = Arc::new(AtomicJobState::new());
        let key = state.jobs.insert(Entry {
            at,
            seq,
            state: Arc::clone(&job_state),
            job,
        });
        state.queue.insert((at, seq), key);

        Ok(ManualJobHandle {
            key,
            state: job_state,
        })
    }

    fn cancel(&self, handle: &Self::Handle) -> bool {
        if !handle.state.finish(JobState::Cancelled) {
            return false;
        }
        let removed = self.inner.lock().remove(handle.key);
        drop(removed);
        true
    }

    fn reschedule(&self, handle: &Self::Handle, at: OffsetDateTime) -> bool {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        if handle.state.get() != JobState::Pending {
            return false;
        }
        let Some(entry) = state.jobs.get_mut(handle.key) else {
            return false;
        };

        state.queue.remove(&(entry.at, entry.seq));
        entry.at = at;
        entry.seq = state.next_seq;
        state.next_seq += 1;
        state.queue.insert((entry.at, entry.seq), handle.key);
        true
    }

    fn has_fired(&self, handle: &Self::Handle) -> bool {
        handle.state.get() == JobState::Fired
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ManualScheduler")
            .field("now", &state.now)
            .field("pending", &state.jobs.len())
            .field("shut_down", &state.shut_down)
            .finish()
    }
}
