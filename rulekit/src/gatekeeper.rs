//! Space commands out in time.
//!
//! Some devices drop commands that arrive too close together. A
//! [`Gatekeeper`] queues commands and runs them one at a time, waiting after
//! each for the pause that was queued with it before starting the next.
//!
//! ```text
//!   add_command ──► [queue] ──► run head ──► wait pause ──► run next ...
//!                                 │                            │
//!                                 └──── queue empty: idle ◄────┘
//! ```

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::tracing::prelude::*;
use crate::when::When;

type Command = Box<dyn FnOnce() + Send + 'static>;

/// Runs queued commands with a minimum pause between them.
///
/// The pause counts from the start of a command, so a command that takes
/// 300 ms followed by a 1 s pause leaves 700 ms of idle time.
pub struct Gatekeeper<S: Scheduler> {
    inner: Arc<Inner<S>>,
}

struct Inner<S: Scheduler> {
    name: String,
    scheduler: S,
    state: Mutex<State<S::Handle>>,
}

struct State<H> {
    queue: VecDeque<(When, Command)>,
    timer: Option<H>,
    /// A command is running or a pause timer is pending.
    busy: bool,
}

impl<S: Scheduler> Gatekeeper<S> {
    pub fn new(scheduler: S) -> Self {
        Self::with_name(scheduler, "gatekeeper")
    }

    /// Create a gatekeeper whose log lines carry `name`.
    pub fn with_name(scheduler: S, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                scheduler,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    timer: None,
                    busy: false,
                }),
            }),
        }
    }

    /// Queue `command`, to be followed by at least `pause` before the next
    /// command runs. When the gatekeeper is idle the command runs right away
    /// on the calling thread.
    ///
    /// `pause` is checked against the current time before queueing.
    pub fn add_command(
        &self,
        pause: impl Into<When>,
        command: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let pause = pause.into();
        pause.resolve(self.inner.scheduler.now())?;

        let start = {
            let mut state = self.inner.state.lock();
            state.queue.push_back((pause, Box::new(command)));
            let idle = !state.busy;
            state.busy = true;
            idle
        };

        if start {
            Inner::run_next(&self.inner)?;
        }
        Ok(())
    }

    /// Drop every queued command and stop the pause timer.
    ///
    /// A command that is already running finishes, and its pause is still
    /// observed if more commands are added during it.
    pub fn cancel_all(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            if let Some(timer) = state.timer.take() {
                if self.inner.scheduler.cancel(&timer) {
                    state.busy = false;
                }
            }
            mem::take(&mut state.queue)
        };

        if !dropped.is_empty() {
            debug!(gatekeeper = %self.inner.name, dropped = dropped.len(), "Queued commands cancelled");
        }
    }

    /// Whether a new command would run immediately.
    pub fn is_idle(&self) -> bool {
        !self.inner.state.lock().busy
    }

    /// Number of commands waiting for their turn.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

impl<S: Scheduler> Inner<S> {
    /// Run the head of the queue and arm the timer for the one after it.
    fn run_next(this: &Arc<Self>) -> Result<()> {
        let next = {
            let mut state = this.state.lock();
            state.timer = None;
            let next = state.queue.pop_front();
            if next.is_none() {
                state.busy = false;
            }
            next
        };

        let Some((pause, command)) = next else {
            trace!(gatekeeper = %this.name, "Queue drained");
            return Ok(());
        };

        let before = this.scheduler.now();
        command();
        let after = this.scheduler.now();

        let at = match pause.resolve(before) {
            Ok(at) => at,
            Err(e) => {
                this.state.lock().busy = false;
                return Err(e);
            }
        };
        trace!(gatekeeper = %this.name, took = %(after - before), next = %at, "Command done");

        let weak = Arc::downgrade(this);
        let handle = match this.scheduler.schedule(at, next_job(weak)) {
            Ok(handle) => handle,
            Err(e) => {
                error!(gatekeeper = %this.name, "Failed to schedule next command: {e}");
                this.state.lock().busy = false;
                return Err(e.into());
            }
        };

        this.state.lock().timer = Some(handle);
        Ok(())
    }
}

fn next_job<S: Scheduler>(inner: Weak<Inner<S>>) -> crate::scheduler::Job {
    Box::new(move || {
        if let Some(inner) = inner.upgrade() {
            if let Err(e) = Inner::run_next(&inner) {
                warn!(gatekeeper = %inner.name, "Gatekeeper stalled: {e}");
            }
        }
    })
}

impl<S: Scheduler> Drop for Inner<S> {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            self.scheduler.cancel(&timer);
        }
    }
}

impl<S: Scheduler> std::fmt::Debug for Gatekeeper<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Gatekeeper")
            .field("name", &self.inner.name)
            .field("queued", &state.queue.len())
            .field("busy", &state.busy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::OffsetDateTime;
    use time::macros::datetime;

    use super::*;
    use crate::scheduler::{Clock, ManualScheduler};

    const START: OffsetDateTime = datetime!(2024-03-10 18:00:00 UTC);

    type Log = Arc<Mutex<Vec<(&'static str, OffsetDateTime)>>>;

    fn record(log: &Log, clock: &ManualScheduler, name: &'static str) -> impl FnOnce() + Send + 'static {
        let log = Arc::clone(log);
        let clock = clock.clone();
        move || log.lock().push((name, clock.now()))
    }

    #[test]
    fn spaces_commands_by_pause() {
        let scheduler = ManualScheduler::new(START);
        let gate = Gatekeeper::new(scheduler.clone());
        let log = Log::default();

        gate.add_command(Duration::from_secs(1), record(&log, &scheduler, "a"))
            .unwrap();
        gate.add_command(Duration::from_secs(2), record(&log, &scheduler, "b"))
            .unwrap();
        gate.add_command(Duration::from_secs(1), record(&log, &scheduler, "c"))
            .unwrap();

        assert_eq!(*log.lock(), vec![("a", START)]);
        assert_eq!(gate.queued(), 2);
        assert!(!gate.is_idle());

        scheduler.advance(Duration::from_secs(10));
        assert_eq!(
            *log.lock(),
            vec![
                ("a", START),
                ("b", START + Duration::from_secs(1)),
                ("c", START + Duration::from_secs(3)),
            ]
        );
        assert!(gate.is_idle());
    }

    #[test]
    fn pause_includes_command_runtime() {
        let scheduler = ManualScheduler::new(START);
        let gate = Gatekeeper::new(scheduler.clone());
        let log = Log::default();

        let slow_clock = scheduler.clone();
        gate.add_command(Duration::from_secs(1), move || {
            slow_clock.advance(Duration::from_millis(300));
        })
        .unwrap();
        gate.add_command(Duration::ZERO, record(&log, &scheduler, "next"))
            .unwrap();

        scheduler.advance(Duration::from_secs(5));
        assert_eq!(*log.lock(), vec![("next", START + Duration::from_secs(1))]);
    }

    #[test]
    fn idle_again_after_last_pause() {
        let scheduler = ManualScheduler::new(START);
        let gate = Gatekeeper::new(scheduler.clone());
        let log = Log::default();

        gate.add_command(Duration::from_secs(1), record(&log, &scheduler, "a"))
            .unwrap();
        assert!(!gate.is_idle());

        scheduler.advance(Duration::from_secs(1));
        assert!(gate.is_idle());

        gate.add_command(Duration::from_secs(1), record(&log, &scheduler, "b"))
            .unwrap();
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn cancel_all_drops_queue() {
        let scheduler = ManualScheduler::new(START);
        let gate = Gatekeeper::new(scheduler.clone());
        let log = Log::default();

        for name in ["a", "b", "c"] {
            gate.add_command(Duration::from_secs(1), record(&log, &scheduler, name))
                .unwrap();
        }
        gate.cancel_all();

        assert!(gate.is_idle());
        assert_eq!(gate.queued(), 0);
        assert_eq!(scheduler.pending(), 0);

        scheduler.advance(Duration::from_secs(10));
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn bad_pause_is_rejected_up_front() {
        let scheduler = ManualScheduler::new(START);
        let gate = Gatekeeper::new(scheduler);

        assert!(gate.add_command(Duration::MAX, || {}).is_err());
        assert!(gate.is_idle());
        assert_eq!(gate.queued(), 0);
    }

    #[test]
    fn dropping_gatekeeper_cancels_timer() {
        let scheduler = ManualScheduler::new(START);
        let gate = Gatekeeper::new(scheduler.clone());

        gate.add_command(Duration::from_secs(1), || {}).unwrap();
        gate.add_command(Duration::from_secs(1), || {}).unwrap();
        drop(gate);

        assert_eq!(scheduler.pending(), 0);
    }
}
