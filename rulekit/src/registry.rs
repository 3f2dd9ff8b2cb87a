//! Keyed timer registry: at most one outstanding timer per key.
//!
//! Rules often need "do X in five minutes unless something happens first",
//! keyed by the item that triggered them. [`TimerRegistry`] tracks those
//! timers by name and decides what a repeated request for the same key
//! means: either push the existing timer back (`reschedule`) or treat the
//! repeat as flapping and drop the timer altogether.
//!
//! # State Machine (per key)
//!
//! ```text
//!                 check()
//!   Absent ─────────────────► Scheduled ◄──┐ check(reschedule = true)
//!     ▲                        │  │  │     │
//!     │ cancel() or            │  │  └─────┘
//!     │ check(reschedule=false)│  │
//!     ├────────────────────────┘  │ matures
//!     │                           ▼
//!     │      self_cleanup      on_fire()      !self_cleanup
//!     ├─────────────────────────┤ ├─────────────────────► Fired
//!     │                                                    │
//!     └──────────────────── cancel() ──────────────────────┘
//! ```
//!
//! - **Scheduled:** a live scheduler job exists for the key. A repeated
//!   [`check`](TimerRegistry::check) is a *collision*: the collision callback
//!   runs and the timer is either moved or cancelled.
//! - **Fired:** the fire callback has run (or is running) but the entry is
//!   retained because `self_cleanup` was off. [`has_timer`] still reports
//!   it. A `check` on a fired key starts a fresh timer without invoking the
//!   collision callback.
//!
//! Rescheduling only moves the firing time. The fire callback and cleanup
//! policy registered by the first `check` stay in force; ones passed with
//! the rescheduling call are discarded.
//!
//! [`has_timer`]: TimerRegistry::has_timer

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Result;
use crate::scheduler::{Job, Scheduler};
use crate::tracing::prelude::*;
use crate::when::When;

/// A callback run by the registry.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Options for [`TimerRegistry::check`].
///
/// Defaults: no callbacks, `reschedule` off, `self_cleanup` on.
pub struct CheckOptions {
    on_fire: Option<Callback>,
    on_collision: Option<Callback>,
    reschedule: bool,
    self_cleanup: bool,
}

impl CheckOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` when the timer matures.
    pub fn on_fire(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_fire = Some(Box::new(f));
        self
    }

    /// Run `f` synchronously if the key already has a live timer.
    pub fn on_collision(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_collision = Some(Box::new(f));
        self
    }

    /// On collision, move the existing timer instead of cancelling it.
    pub fn reschedule(mut self, reschedule: bool) -> Self {
        self.reschedule = reschedule;
        self
    }

    /// Remove the entry once its fire callback has run. When off, the entry
    /// stays until [`TimerRegistry::cancel`].
    pub fn self_cleanup(mut self, self_cleanup: bool) -> Self {
        self.self_cleanup = self_cleanup;
        self
    }
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            on_fire: None,
            on_collision: None,
            reschedule: false,
            self_cleanup: true,
        }
    }
}

impl std::fmt::Debug for CheckOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckOptions")
            .field("on_fire", &self.on_fire.is_some())
            .field("on_collision", &self.on_collision.is_some())
            .field("reschedule", &self.reschedule)
            .field("self_cleanup", &self.self_cleanup)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
enum EntryState {
    Scheduled,
    Fired,
}

struct TimerEntry<H> {
    /// Distinguishes this entry from later ones under the same key, so a
    /// late completion never acts on a replacement.
    id: u64,
    handle: H,
    on_fire: Option<Callback>,
    self_cleanup: bool,
    state: EntryState,
}

/// Registry of named timers on top of a [`Scheduler`].
///
/// Cloning is cheap and clones share the same timers. When the last clone
/// is dropped, every outstanding timer is cancelled.
///
/// Callbacks run without the registry lock held and may call back into the
/// registry. A callback that captures a clone of its own registry keeps the
/// registry alive until that timer fires or is cancelled.
pub struct TimerRegistry<S: Scheduler> {
    inner: Arc<Inner<S>>,
}

struct Inner<S: Scheduler> {
    scheduler: S,
    entries: Mutex<HashMap<String, TimerEntry<S::Handle>>>,
    next_id: AtomicU64,
}

impl<S: Scheduler> Clone for TimerRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Scheduler> TimerRegistry<S> {
    /// Create an empty registry that submits its timers to `scheduler`.
    pub fn new(scheduler: S) -> Self {
        Self {
            inner: Arc::new(Inner {
                scheduler,
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn scheduler(&self) -> &S {
        &self.inner.scheduler
    }

    /// Create, move, or cancel the timer for `key`.
    ///
    /// - No timer for `key` (or only a fired, retained one): schedule a new
    ///   timer for `when` running `on_fire`.
    /// - A live timer exists: with `reschedule`, move it to `when`; without,
    ///   cancel it and leave the key empty. Either way `on_collision` then
    ///   runs on the calling thread.
    ///
    /// Fails with [`InvalidTimeFormat`](crate::Error::InvalidTimeFormat) if
    /// `when` can't be resolved, or
    /// [`SchedulerUnavailable`](crate::Error::SchedulerUnavailable) if the
    /// scheduler refuses the job. The registry is unchanged on failure.
    pub fn check(
        &self,
        key: impl Into<String>,
        when: impl Into<When>,
        options: CheckOptions,
    ) -> Result<()> {
        let key = key.into();
        let when = when.into();
        let CheckOptions {
            on_fire,
            on_collision,
            reschedule,
            self_cleanup,
        } = options;

        let at = when.resolve(self.inner.scheduler.now()).inspect_err(|e| {
            warn!(key = %key, when = %when, "Not scheduling timer: {e}");
        })?;

        let mut cancelled = None;
        let collided = {
            let mut entries = self.inner.entries.lock();

            let live = entries
                .get(&key)
                .is_some_and(|entry| entry.state == EntryState::Scheduled);

            if live && reschedule {
                if let Some(entry) = entries.get(&key) {
                    if self.inner.scheduler.reschedule(&entry.handle, at) {
                        debug!(key = %key, at = %at, "Timer rescheduled");
                    } else {
                        trace!(key = %key, "Timer matured before it could be rescheduled");
                    }
                }
                if on_fire.is_some() {
                    debug!(key = %key, "Reschedule keeps the original fire callback");
                }
                true
            } else if live {
                cancelled = entries.remove(&key);
                if let Some(entry) = &cancelled {
                    self.inner.scheduler.cancel(&entry.handle);
                }
                debug!(key = %key, "Timer cancelled on collision");
                true
            } else {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let job = completion_job(Arc::downgrade(&self.inner), key.clone(), id);
                let handle = self.inner.scheduler.schedule(at, job).inspect_err(|e| {
                    error!(key = %key, "Failed to schedule timer: {e}");
                })?;

                let previous = entries.insert(
                    key.clone(),
                    TimerEntry {
                        id,
                        handle,
                        on_fire,
                        self_cleanup,
                        state: EntryState::Scheduled,
                    },
                );
                if previous.is_some() {
                    debug!(key = %key, at = %at, "Fired timer replaced");
                } else {
                    debug!(key = %key, at = %at, "Timer created");
                }
                false
            }
        };

        // The cancelled entry may own captures that call back into us.
        drop(cancelled);

        if collided {
            if let Some(on_collision) = on_collision {
                debug!(key = %key, "Running collision callback");
                on_collision();
            }
        }

        Ok(())
    }

    /// Whether `key` has a timer, live or fired-and-retained.
    pub fn has_timer(&self, key: &str) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    /// Cancel and forget the timer for `key`. Does nothing if there is none.
    pub fn cancel(&self, key: &str) {
        let removed = self.inner.entries.lock().remove(key);

        if let Some(entry) = removed {
            if self.inner.scheduler.cancel(&entry.handle) {
                debug!(key, "Timer cancelled");
            } else {
                trace!(key, state = %entry.state, "Timer already matured, entry removed");
            }
        }
    }

    /// Cancel and forget every timer.
    ///
    /// Entries are taken out under the lock in one step, so completions
    /// racing with this call find nothing to clean up.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.inner.entries.lock().drain().collect();

        for (key, entry) in drained {
            if !self.inner.scheduler.has_fired(&entry.handle) {
                self.inner.scheduler.cancel(&entry.handle);
                debug!(key = %key, "Timer cancelled");
            } else {
                trace!(key = %key, "Fired timer entry removed");
            }
        }
    }

    /// Number of keys with a timer.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the keys with a timer, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.lock().keys().cloned().collect()
    }
}

impl<S: Scheduler> std::fmt::Debug for TimerRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerRegistry")
            .field("timers", &self.len())
            .finish()
    }
}

fn completion_job<S: Scheduler>(inner: Weak<Inner<S>>, key: String, id: u64) -> Job {
    Box::new(move || {
        if let Some(inner) = inner.upgrade() {
            inner.complete(&key, id);
        }
    })
}

impl<S: Scheduler> Inner<S> {
    /// Called by the scheduler when the timer for `key` matures.
    fn complete(&self, key: &str, id: u64) {
        let (on_fire, self_cleanup) = {
            let mut entries = self.entries.lock();
            match entries.get_mut(key) {
                Some(entry) if entry.id == id => {
                    entry.state = EntryState::Fired;
                    (entry.on_fire.take(), entry.self_cleanup)
                }
                _ => {
                    trace!(key, "Timer matured after its entry was removed");
                    return;
                }
            }
        };

        debug!(key, "Timer fired");
        let cleanup = Cleanup {
            inner: self,
            key,
            id,
            enabled: self_cleanup,
        };

        let Some(on_fire) = on_fire else {
            return;
        };

        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(on_fire)) {
            error!(key, "Timer callback panicked");
            drop(cleanup);
            panic::resume_unwind(panic);
        }
    }
}

impl<S: Scheduler> Drop for Inner<S> {
    fn drop(&mut self) {
        for (key, entry) in self.entries.get_mut().drain() {
            if self.scheduler.cancel(&entry.handle) {
                trace!(key = %key, "Timer cancelled on registry drop");
            }
        }
    }
}

/// Removes a fired self-cleaning entry when dropped, including during a
/// panic in the fire callback. Only the entry with the matching id is
/// removed; a replacement installed by the callback survives.
struct Cleanup<'a, S: Scheduler> {
    inner: &'a Inner<S>,
    key: &'a str,
    id: u64,
    enabled: bool,
}

impl<S: Scheduler> Drop for Cleanup<'_, S> {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }

        let mut entries = self.inner.entries.lock();
        if entries.get(self.key).is_some_and(|entry| entry.id == self.id) {
            entries.remove(self.key);
            trace!(key = self.key, "Timer entry cleaned up");
        }
    }
}
