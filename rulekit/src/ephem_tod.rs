//! Time-of-day state machine.
//!
//! A day is split into periods (`MORNING`, `DAY`, `EVENING`, `NIGHT`, ...),
//! each starting at a time of day. [`TimeOfDay`] works out which period is
//! current and arms one timer per period still to start today. Shortly after
//! midnight it asks for the next day's periods and starts over, so plans that
//! differ by day type (weekend, holiday) or follow the sun are picked up.
//!
//! ```text
//!   00:00      06:00        09:00             18:00          22:00
//!     │ NIGHT    │ MORNING    │ DAY             │ EVENING      │ NIGHT
//!     └──────────┴────────────┴─────────────────┴──────────────┴──────►
//!                                  ▲ now
//!                       current = DAY, timers at 18:00 and 22:00,
//!                       reload at 00:02 tomorrow
//! ```
//!
//! Before today's first period starts, the day's last period is current: it
//! carried over from the previous evening.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use time::{OffsetDateTime, Time};

use crate::error::{Error, Result};
use crate::registry::{CheckOptions, TimerRegistry};
use crate::scheduler::Scheduler;
use crate::tracing::prelude::*;
use crate::when::When;

/// When the plan is reloaded each night. A little after midnight, so
/// sources that compute the day's times at midnight have done so.
pub const RELOAD_AT: Time = time::macros::time!(0:02);

const RELOAD_KEY: &str = "reload";

/// One period of the day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Period {
    pub state: String,
    pub start: When,
}

impl Period {
    pub fn new(state: impl Into<String>, start: impl Into<When>) -> Self {
        Self {
            state: state.into(),
            start: start.into(),
        }
    }
}

type Plan = Box<dyn Fn(OffsetDateTime) -> Vec<Period> + Send + Sync + 'static>;
type OnChange = Box<dyn Fn(&str) + Send + Sync + 'static>;

/// Drives a time-of-day state through the day.
///
/// Dropping it cancels its timers.
pub struct TimeOfDay<S: Scheduler> {
    inner: Arc<Inner<S>>,
}

struct Inner<S: Scheduler> {
    timers: TimerRegistry<S>,
    plan: Plan,
    on_change: OnChange,
    current: Mutex<Option<String>>,
}

impl<S: Scheduler> TimeOfDay<S> {
    /// Start tracking the time of day.
    ///
    /// `plan` is asked for the periods of the day containing its argument,
    /// now and after every midnight. `on_change` is called with the new
    /// state whenever it changes, including once from this call.
    pub fn start(
        scheduler: S,
        plan: impl Fn(OffsetDateTime) -> Vec<Period> + Send + Sync + 'static,
        on_change: impl Fn(&str) + Send + Sync + 'static,
    ) -> Result<Self> {
        let inner = Arc::new(Inner {
            timers: TimerRegistry::new(scheduler),
            plan: Box::new(plan),
            on_change: Box::new(on_change),
            current: Mutex::new(None),
        });
        Inner::reload(&inner)?;
        Ok(Self { inner })
    }

    /// Recompute today's periods and timers, e.g. after the plan's inputs
    /// changed.
    pub fn reload(&self) -> Result<()> {
        Inner::reload(&self.inner)
    }

    /// The current state.
    pub fn current(&self) -> Option<String> {
        self.inner.current.lock().clone()
    }

    /// States with a transition still to come today.
    pub fn upcoming(&self) -> Vec<String> {
        let mut keys = self.inner.timers.keys();
        keys.retain(|key| key != RELOAD_KEY);
        keys.sort();
        keys
    }
}

impl<S: Scheduler> Inner<S> {
    fn reload(this: &Arc<Self>) -> Result<()> {
        let now = this.timers.scheduler().now();
        let periods = (this.plan)(now);
        if periods.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "no time-of-day periods for {}",
                now.date()
            )));
        }

        let mut starts = periods
            .into_iter()
            .map(|period| -> Result<_> { Ok((period.start.to_today(now)?, period.state)) })
            .collect::<Result<Vec<_>>>()?;
        starts.sort();

        this.timers.cancel_all();

        let mut current = starts.last().map(|(_, state)| state.clone());
        for (at, state) in starts {
            if at <= now {
                trace!(%state, %at, "Period already started");
                current = Some(state);
                continue;
            }

            debug!(%state, %at, "Scheduling transition");
            let key = format!("{state}@{:02}:{:02}:{:02}", at.hour(), at.minute(), at.second());
            let inner = Arc::downgrade(this);
            this.timers.check(
                key,
                at,
                CheckOptions::new().on_fire(move || transition(&inner, state)),
            )?;
        }

        let reload_at = next_reload(now)?;
        debug!(at = %reload_at, "Scheduling reload");
        let inner = Arc::downgrade(this);
        this.timers.check(
            RELOAD_KEY,
            reload_at,
            CheckOptions::new().on_fire(move || {
                if let Some(inner) = inner.upgrade() {
                    if let Err(e) = Inner::reload(&inner) {
                        error!("Time of day reload failed: {e}");
                    }
                }
            }),
        )?;

        if let Some(state) = current {
            this.enter(state);
        }
        Ok(())
    }

    fn enter(&self, state: String) {
        let previous = self.current.lock().replace(state.clone());
        if previous.as_deref() == Some(state.as_str()) {
            trace!(%state, "Time of day unchanged");
            return;
        }

        info!(
            from = previous.as_deref().unwrap_or("none"),
            to = %state,
            "Time of day transition"
        );
        (self.on_change)(&state);
    }
}

fn transition<S: Scheduler>(inner: &Weak<Inner<S>>, state: String) {
    if let Some(inner) = inner.upgrade() {
        inner.enter(state);
    }
}

fn next_reload(now: OffsetDateTime) -> Result<OffsetDateTime> {
    let tomorrow = now
        .date()
        .next_day()
        .ok_or_else(|| Error::InvalidTimeFormat(format!("no day after {}", now.date())))?;
    // Started between midnight and the reload time.
    let today = now.replace_time(RELOAD_AT);
    if today > now {
        return Ok(today);
    }
    Ok(now.replace_date(tomorrow).replace_time(RELOAD_AT))
}

impl<S: Scheduler> Drop for Inner<S> {
    fn drop(&mut self) {
        self.timers.cancel_all();
    }
}

impl<S: Scheduler> std::fmt::Debug for TimeOfDay<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeOfDay")
            .field("current", &self.current())
            .field("upcoming", &self.upcoming())
            .finish()
    }
}
