//! Timer that reports its remaining time as it counts down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
use crate::looping::LoopingTimer;
use crate::scheduler::Scheduler;
use crate::tracing::prelude::*;
use crate::when::When;

/// Default interval between remaining-time reports.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

type TickFn = Arc<dyn Fn(Duration) + Send + Sync + 'static>;

/// Runs `on_done` at a deadline and reports the time left to `on_tick`
/// along the way.
///
/// `on_tick` is called immediately with the full duration, then once per
/// tick with the time still to go. When the remainder isn't a whole number
/// of ticks the last interval is shorter, so the final report of zero lands
/// on the deadline.
///
/// Dropping the countdown stops the reports but not `on_done`; use
/// [`cancel`](Self::cancel) to stop both.
///
/// ```text
///   when = 2.5 s, tick = 1 s
///
///   t:      0     1     2    2.5
///   tick: 2.5   1.5   0.5     0
///   done:                     ✓
/// ```
pub struct CountdownTimer<S: Scheduler + Clone> {
    scheduler: S,
    done: S::Handle,
    ticker: LoopingTimer<S>,
    on_tick: TickFn,
    remaining: Arc<Mutex<Duration>>,
    cancelled: AtomicBool,
}

impl<S: Scheduler + Clone> CountdownTimer<S> {
    /// Start a countdown to `when` reporting every [`DEFAULT_TICK`].
    pub fn start(
        scheduler: S,
        when: impl Into<When>,
        on_done: impl FnOnce() + Send + 'static,
        on_tick: impl Fn(Duration) + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::with_tick(scheduler, when, DEFAULT_TICK, on_done, on_tick)
    }

    /// Start a countdown reporting every `tick`. A zero tick is treated as
    /// [`DEFAULT_TICK`].
    pub fn with_tick(
        scheduler: S,
        when: impl Into<When>,
        tick: Duration,
        on_done: impl FnOnce() + Send + 'static,
        on_tick: impl Fn(Duration) + Send + Sync + 'static,
    ) -> Result<Self> {
        let tick = if tick.is_zero() { DEFAULT_TICK } else { tick };
        let now = scheduler.now();
        let end = when.into().resolve(now)?;
        let total = Duration::try_from(end - now).unwrap_or(Duration::ZERO);

        let done = scheduler.schedule(end, Box::new(on_done))?;
        debug!(%end, remaining = ?total, "Countdown started");

        let on_tick: TickFn = Arc::new(on_tick);
        let remaining = Arc::new(Mutex::new(total));
        let ticker = LoopingTimer::new(scheduler.clone());

        let loop_tick = Arc::clone(&on_tick);
        let loop_remaining = Arc::clone(&remaining);
        let started = ticker.start(None, move || {
            let left = *loop_remaining.lock();
            loop_tick(left);
            if left.is_zero() {
                return None;
            }
            let step = left.min(tick);
            *loop_remaining.lock() = left - step;
            Some(When::Delay(step))
        });

        if let Err(e) = started {
            scheduler.cancel(&done);
            return Err(e);
        }

        Ok(Self {
            scheduler,
            done,
            ticker,
            on_tick,
            remaining,
            cancelled: AtomicBool::new(false),
        })
    }

    /// Stop the countdown. Reports zero to `on_tick` and returns `true` if
    /// `on_done` was prevented from running.
    pub fn cancel(&self) -> bool {
        self.cancelled.store(true, Ordering::SeqCst);
        self.ticker.cancel();
        *self.remaining.lock() = Duration::ZERO;
        (self.on_tick)(Duration::ZERO);
        self.scheduler.cancel(&self.done)
    }

    /// Whether `on_done` has run or the countdown was cancelled.
    pub fn has_terminated(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.scheduler.has_fired(&self.done)
    }

    /// Time left as of the most recent report.
    pub fn remaining(&self) -> Duration {
        *self.remaining.lock()
    }
}

impl<S: Scheduler + Clone> std::fmt::Debug for CountdownTimer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountdownTimer")
            .field("remaining", &self.remaining())
            .field("terminated", &self.has_terminated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use time::macros::datetime;

    use super::*;
    use crate::scheduler::{Clock, ManualScheduler};
    use crate::when::format_remaining;

    fn recorder() -> (Arc<Mutex<Vec<Duration>>>, impl Fn(Duration) + Send + Sync + 'static) {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        (reports, move |left| sink.lock().push(left))
    }

    fn done_counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hit = Arc::clone(&count);
        (count, move || {
            hit.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn scheduler() -> ManualScheduler {
        ManualScheduler::new(datetime!(2024-12-24 17:00:00 UTC))
    }

    #[test]
    fn calls_done_at_deadline() {
        let scheduler = scheduler();
        let (done, on_done) = done_counter();
        let (_reports, on_tick) = recorder();

        let countdown =
            CountdownTimer::start(scheduler.clone(), "2s".parse::<When>().unwrap(), on_done, on_tick)
                .unwrap();

        scheduler.advance(Duration::from_millis(1900));
        assert_eq!(done.load(Ordering::SeqCst), 0);
        assert!(!countdown.has_terminated());

        scheduler.advance(Duration::from_millis(200));
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(countdown.has_terminated());
    }

    #[test]
    fn reports_every_second_down_to_zero() {
        let scheduler = scheduler();
        let (_done, on_done) = done_counter();
        let (reports, on_tick) = recorder();

        let countdown =
            CountdownTimer::start(scheduler.clone(), Duration::from_secs(4), on_done, on_tick)
                .unwrap();
        assert_eq!(*reports.lock(), vec![Duration::from_secs(4)]);

        scheduler.advance(Duration::from_secs(10));
        let secs: Vec<u64> = reports.lock().iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![4, 3, 2, 1, 0]);
        assert_eq!(countdown.remaining(), Duration::ZERO);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn fractional_countdown_ends_with_short_tick() {
        let scheduler = scheduler();
        let (done, on_done) = done_counter();
        let (reports, on_tick) = recorder();

        let _countdown =
            CountdownTimer::start(scheduler.clone(), When::millis(2100), on_done, on_tick)
                .unwrap();

        scheduler.advance(Duration::from_millis(2100));
        assert_eq!(
            *reports.lock(),
            vec![
                Duration::from_millis(2100),
                Duration::from_millis(1100),
                Duration::from_millis(100),
                Duration::ZERO,
            ]
        );
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn custom_tick() {
        let scheduler = scheduler();
        let (_done, on_done) = done_counter();
        let (reports, on_tick) = recorder();

        let _countdown = CountdownTimer::with_tick(
            scheduler.clone(),
            Duration::from_secs(90),
            Duration::from_secs(30),
            on_done,
            on_tick,
        )
        .unwrap();

        scheduler.advance(Duration::from_secs(90));
        let shown: Vec<String> = reports.lock().iter().copied().map(format_remaining).collect();
        assert_eq!(shown, vec!["0:01:30", "0:01:00", "0:00:30", "0:00:00"]);
    }

    #[test]
    fn cancel_reports_zero_and_stops() {
        let scheduler = scheduler();
        let (done, on_done) = done_counter();
        let (reports, on_tick) = recorder();

        let countdown =
            CountdownTimer::start(scheduler.clone(), Duration::from_secs(5), on_done, on_tick)
                .unwrap();
        scheduler.advance(Duration::from_millis(1500));

        assert!(countdown.cancel());
        assert!(countdown.has_terminated());
        assert_eq!(reports.lock().last(), Some(&Duration::ZERO));

        let before = reports.lock().len();
        scheduler.advance(Duration::from_secs(10));
        assert_eq!(reports.lock().len(), before);
        assert_eq!(done.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn past_deadline_finishes_immediately() {
        let scheduler = scheduler();
        let (done, on_done) = done_counter();
        let (reports, on_tick) = recorder();
        let past = scheduler.now() - Duration::from_secs(30);

        let countdown = CountdownTimer::start(scheduler.clone(), past, on_done, on_tick).unwrap();
        assert_eq!(*reports.lock(), vec![Duration::ZERO]);

        scheduler.advance(Duration::ZERO);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(countdown.has_terminated());
    }
}
