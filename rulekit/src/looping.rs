//! A timer that decides its own next run.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Result;
use crate::scheduler::{Job, Scheduler};
use crate::tracing::prelude::*;
use crate::when::When;

type LoopFn = Box<dyn FnMut() -> Option<When> + Send + 'static>;

/// Repeatedly runs a closure, rescheduling it at whatever [`When`] it
/// returns, until it returns `None` or the loop is cancelled.
///
/// The returned `When` is resolved against the clock after the closure
/// finishes, so a delay is measured from the end of the previous run.
pub struct LoopingTimer<S: Scheduler> {
    inner: Arc<Inner<S>>,
}

struct Inner<S: Scheduler> {
    scheduler: S,
    state: Mutex<State<S::Handle>>,
}

struct State<H> {
    /// Bumped by every `start` and `cancel`; timers from an older
    /// generation do nothing when they fire.
    generation: u64,
    timer: Option<H>,
    func: Option<LoopFn>,
    running: bool,
}

impl<S: Scheduler> LoopingTimer<S> {
    pub fn new(scheduler: S) -> Self {
        Self {
            inner: Arc::new(Inner {
                scheduler,
                state: Mutex::new(State {
                    generation: 0,
                    timer: None,
                    func: None,
                    running: false,
                }),
            }),
        }
    }

    /// Start looping `f`, first at `first` or right away on the calling
    /// thread when `first` is `None`. Replaces any loop already running.
    pub fn start(
        &self,
        first: Option<When>,
        f: impl FnMut() -> Option<When> + Send + 'static,
    ) -> Result<()> {
        let (generation, previous) = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            if let Some(timer) = state.timer.take() {
                self.inner.scheduler.cancel(&timer);
            }
            (state.generation, state.func.replace(Box::new(f)))
        };
        drop(previous);

        match first {
            None => Inner::iterate(&self.inner, generation),
            Some(when) => Inner::arm(&self.inner, generation, when),
        }
    }

    /// Stop the loop. Returns `true` if a pending run was prevented.
    pub fn cancel(&self) -> bool {
        let (timer, func) = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            (state.timer.take(), state.func.take())
        };
        drop(func);

        let stopped = timer.is_some_and(|timer| self.inner.scheduler.cancel(&timer));
        if stopped {
            debug!("Looping timer cancelled");
        }
        stopped
    }

    /// True when nothing is pending or running: the loop was never started,
    /// ended by returning `None`, or was cancelled.
    pub fn has_terminated(&self) -> bool {
        let state = self.inner.state.lock();
        !state.running
            && state
                .timer
                .as_ref()
                .is_none_or(|timer| self.inner.scheduler.has_fired(timer))
    }
}

impl<S: Scheduler> Inner<S> {
    fn arm(this: &Arc<Self>, generation: u64, when: When) -> Result<()> {
        let at = when.resolve(this.scheduler.now())?;
        let handle = this
            .scheduler
            .schedule(at, iterate_job(Arc::downgrade(this), generation))?;

        let mut state = this.state.lock();
        if state.generation == generation {
            state.timer = Some(handle);
        } else {
            // Cancelled or restarted while we were scheduling.
            this.scheduler.cancel(&handle);
        }
        Ok(())
    }

    fn iterate(this: &Arc<Self>, generation: u64) -> Result<()> {
        let func = {
            let mut state = this.state.lock();
            if state.generation != generation {
                return Ok(());
            }
            state.running = true;
            state.func.take()
        };
        let Some(mut func) = func else {
            this.state.lock().running = false;
            return Ok(());
        };

        let next = func();

        {
            let mut state = this.state.lock();
            state.running = false;
            if state.generation != generation {
                return Ok(());
            }
            state.func = Some(func);
        }

        match next {
            Some(when) => Inner::arm(this, generation, when),
            None => {
                trace!("Looping timer finished");
                this.state.lock().func = None;
                Ok(())
            }
        }
    }
}

fn iterate_job<S: Scheduler>(inner: Weak<Inner<S>>, generation: u64) -> Job {
    Box::new(move || {
        if let Some(inner) = inner.upgrade() {
            if let Err(e) = Inner::iterate(&inner, generation) {
                warn!("Looping timer stopped: {e}");
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

impl<S: Scheduler> std::fmt::Debug for LoopingTimer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopingTimer")
            .field("terminated", &self.has_terminated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use time::OffsetDateTime;
    use time::macros::datetime;

    use super::*;
    use crate::scheduler::{Clock, ManualScheduler};

    const START: OffsetDateTime = datetime!(2024-07-04 06:00:00 UTC);

    /// Loop body that records the time of each run and stops after `runs`.
    fn counting(
        clock: &ManualScheduler,
        runs: usize,
        every: Duration,
    ) -> (Arc<Mutex<Vec<OffsetDateTime>>>, impl FnMut() -> Option<When> + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let body_seen = Arc::clone(&seen);
        let clock = clock.clone();
        let body = move || {
            let mut seen = body_seen.lock();
            seen.push(clock.now());
            (seen.len() < runs).then_some(When::Delay(every))
        };
        (seen, body)
    }

    #[test]
    fn loops_until_closure_returns_none() {
        let scheduler = ManualScheduler::new(START);
        let timer = LoopingTimer::new(scheduler.clone());
        let (seen, body) = counting(&scheduler, 3, Duration::from_secs(2));

        timer.start(None, body).unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert!(!timer.has_terminated());

        scheduler.advance(Duration::from_secs(60));
        assert_eq!(
            *seen.lock(),
            vec![
                START,
                START + Duration::from_secs(2),
                START + Duration::from_secs(4)
            ]
        );
        assert!(timer.has_terminated());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn delayed_first_run() {
        let scheduler = ManualScheduler::new(START);
        let timer = LoopingTimer::new(scheduler.clone());
        let (seen, body) = counting(&scheduler, 1, Duration::from_secs(1));

        timer
            .start(Some("5s".parse().unwrap()), body)
            .unwrap();
        assert!(seen.lock().is_empty());
        assert!(!timer.has_terminated());

        scheduler.advance(Duration::from_secs(5));
        assert_eq!(*seen.lock(), vec![START + Duration::from_secs(5)]);
        assert!(timer.has_terminated());
    }

    #[test]
    fn cancel_stops_loop() {
        let scheduler = ManualScheduler::new(START);
        let timer = LoopingTimer::new(scheduler.clone());
        let (seen, body) = counting(&scheduler, 100, Duration::from_secs(1));

        timer.start(None, body).unwrap();
        scheduler.advance(Duration::from_secs(2));
        assert!(timer.cancel());
        assert!(!timer.cancel());

        scheduler.advance(Duration::from_secs(10));
        assert_eq!(seen.lock().len(), 3);
        assert!(timer.has_terminated());
    }

    #[test]
    fn restart_replaces_running_loop() {
        let scheduler = ManualScheduler::new(START);
        let timer = LoopingTimer::new(scheduler.clone());
        let (first, first_body) = counting(&scheduler, 100, Duration::from_secs(1));
        let (second, second_body) = counting(&scheduler, 2, Duration::from_secs(1));

        timer.start(None, first_body).unwrap();
        timer.start(None, second_body).unwrap();

        scheduler.advance(Duration::from_secs(10));
        assert_eq!(first.lock().len(), 1);
        assert_eq!(second.lock().len(), 2);
    }

    #[test]
    fn body_can_cancel_its_own_loop() {
        let scheduler = ManualScheduler::new(START);
        let timer = Arc::new(LoopingTimer::new(scheduler.clone()));
        let runs = Arc::new(AtomicUsize::new(0));

        let handle = Arc::downgrade(&timer);
        let body_runs = Arc::clone(&runs);
        timer
            .start(None, move || {
                if body_runs.fetch_add(1, Ordering::SeqCst) == 1 {
                    if let Some(timer) = handle.upgrade() {
                        timer.cancel();
                    }
                }
                Some(When::millis(500))
            })
            .unwrap();

        scheduler.advance(Duration::from_secs(10));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(timer.has_terminated());
    }
}
