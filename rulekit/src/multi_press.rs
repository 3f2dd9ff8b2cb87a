//! Turn raw button press and release events into clicks and holds.
//!
//! # State Machine (per button)
//!
//! ```text
//!                 press                     long_delay
//!   Idle(n) ────────────────► Pressed(n) ─────────────────► Held
//!     ▲  │                       │                            │
//!     │  │ short_delay           │ release                    │ release
//!     │  │ (report n clicks)     ▼                            ▼
//!     │  └──────────────── Idle(n + 1)                  report Release
//!     └───────────────────────────────────────────────────────┘
//! ```
//!
//! A release arms the short timer; a press before it runs continues the
//! count. Holding the button past the long timer reports [`Press::Hold`]
//! instead, and its release reports [`Press::Release`] without counting a
//! click. Repeated events for the state a button is already in are ignored,
//! since some devices resend them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::registry::{CheckOptions, TimerRegistry};
use crate::scheduler::Scheduler;
use crate::tracing::prelude::*;

/// What a button did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Press {
    /// Pressed and released this many times in quick succession.
    Clicks(u32),
    /// Held down past the long-press delay.
    Hold,
    /// Let go after a [`Press::Hold`].
    Release,
}

impl fmt::Display for Press {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Press::Clicks(n) => write!(f, "{n}"),
            Press::Hold => f.write_str("HOLD"),
            Press::Release => f.write_str("RELEASE"),
        }
    }
}

/// Timing and event names for a button.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct MultiPressConfig {
    /// Quiet time after a release before the click count is reported, in
    /// milliseconds in JSON.
    #[serde(deserialize_with = "deserialize_millis")]
    pub short_delay: Duration,

    /// How long the button must stay down to count as a hold, in
    /// milliseconds in JSON.
    #[serde(deserialize_with = "deserialize_millis")]
    pub long_delay: Duration,

    /// Event name meaning "pressed".
    pub on: String,

    /// Event name meaning "released".
    pub off: String,
}

impl Default for MultiPressConfig {
    fn default() -> Self {
        Self {
            short_delay: Duration::from_millis(200),
            long_delay: Duration::from_millis(1000),
            on: "ON".into(),
            off: "OFF".into(),
        }
    }
}

impl MultiPressConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(format!("multi-press config: {e}")))
    }
}

fn deserialize_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

type Sink = Arc<dyn Fn(&str, Press) + Send + Sync + 'static>;

/// Tracks any number of buttons sharing one configuration.
pub struct MultiPress<S: Scheduler> {
    inner: Arc<Inner<S>>,
}

struct Inner<S: Scheduler> {
    config: MultiPressConfig,
    timers: TimerRegistry<S>,
    buttons: Mutex<HashMap<String, Button>>,
    sink: Sink,
}

#[derive(Debug, Default)]
struct Button {
    pressed: bool,
    /// Clicks counted since the last report.
    clicks: u32,
    held: bool,
    /// Bumped on every accepted event; timers armed for an older generation
    /// do nothing.
    generation: u64,
}

enum Timer {
    Long,
    Short,
}

impl<S: Scheduler> MultiPress<S> {
    pub fn new(
        scheduler: S,
        config: MultiPressConfig,
        sink: impl Fn(&str, Press) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                timers: TimerRegistry::new(scheduler),
                buttons: Mutex::new(HashMap::new()),
                sink: Arc::new(sink),
            }),
        }
    }

    /// Feed a raw event name from the device. Names other than the
    /// configured `on` and `off` are logged and ignored.
    pub fn trigger(&self, button: &str, event: &str) -> Result<()> {
        let pressed = if event == self.inner.config.on {
            true
        } else if event == self.inner.config.off {
            false
        } else {
            warn!(button, event, "Unrecognised button event");
            return Ok(());
        };
        self.update(button, pressed)
    }

    /// Record that `button` is now pressed or released.
    pub fn update(&self, button: &str, pressed: bool) -> Result<()> {
        let mut report = None;

        {
            let mut buttons = self.inner.buttons.lock();
            let state = buttons.entry(button.to_string()).or_default();
            if state.pressed == pressed {
                trace!(button, pressed, "Button state unchanged");
                return Ok(());
            }
            state.pressed = pressed;
            state.generation += 1;
            let generation = state.generation;

            // Held across cancel and re-arm; timers take this lock first.
            self.inner.timers.cancel(button);

            if pressed {
                debug!(button, delay = ?self.inner.config.long_delay, "Arming long-press timer");
                self.arm(button, Timer::Long, generation)?;
            } else if state.held {
                state.held = false;
                state.clicks = 0;
                report = Some(Press::Release);
            } else {
                state.clicks += 1;
                debug!(button, clicks = state.clicks, "Arming click timer");
                self.arm(button, Timer::Short, generation)?;
            }
        }

        if let Some(press) = report {
            self.inner.report(button, press);
        }
        Ok(())
    }

    fn arm(&self, button: &str, timer: Timer, generation: u64) -> Result<()> {
        let delay = match timer {
            Timer::Long => self.inner.config.long_delay,
            Timer::Short => self.inner.config.short_delay,
        };
        let inner = Arc::downgrade(&self.inner);
        let name = button.to_string();
        self.inner.timers.check(
            button,
            delay,
            CheckOptions::new().on_fire(move || expired(&inner, &name, timer, generation)),
        )
    }

    /// Forget all buttons and cancel their timers.
    pub fn reset(&self) {
        let mut buttons = self.inner.buttons.lock();
        self.inner.timers.cancel_all();
        buttons.clear();
    }

    pub fn config(&self) -> &MultiPressConfig {
        &self.inner.config
    }
}

fn expired<S: Scheduler>(inner: &Weak<Inner<S>>, button: &str, timer: Timer, generation: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let press = {
        let mut buttons = inner.buttons.lock();
        let Some(state) = buttons.get_mut(button) else {
            return;
        };
        if state.generation != generation {
            trace!(button, "Stale button timer");
            return;
        }

        match timer {
            Timer::Long => {
                state.held = true;
                state.clicks = 0;
                Press::Hold
            }
            Timer::Short => Press::Clicks(std::mem::take(&mut state.clicks)),
        }
    };

    inner.report(button, press);
}

impl<S: Scheduler> Inner<S> {
    fn report(&self, button: &str, press: Press) {
        debug!(button, %press, "Button press");
        (self.sink)(button, press);
    }
}

impl<S: Scheduler> fmt::Debug for MultiPress<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiPress")
            .field("config", &self.inner.config)
            .field("buttons", &self.inner.buttons.lock().len())
            .finish()
    }
}
