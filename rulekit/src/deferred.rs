//! Deliver a value to a named target later.

use std::sync::Arc;

use crate::error::Result;
use crate::registry::{CheckOptions, TimerRegistry};
use crate::scheduler::Scheduler;
use crate::tracing::prelude::*;
use crate::when::When;

type Sink<T> = Arc<dyn Fn(&str, T) + Send + Sync + 'static>;

/// Schedules values for delivery to named targets, one pending value per
/// target.
///
/// What "delivery" means is up to the sink passed to [`Deferred::new`];
/// typically it commands or updates the named device.
pub struct Deferred<S: Scheduler, T> {
    timers: TimerRegistry<S>,
    sink: Sink<T>,
}

impl<S: Scheduler, T: Send + 'static> Deferred<S, T> {
    pub fn new(scheduler: S, sink: impl Fn(&str, T) + Send + Sync + 'static) -> Self {
        Self {
            timers: TimerRegistry::new(scheduler),
            sink: Arc::new(sink),
        }
    }

    /// Deliver `value` to `target` at `when`. Times already past deliver as
    /// soon as possible. A value still pending for `target` is replaced.
    pub fn defer(&self, target: &str, value: T, when: impl Into<When>) -> Result<()> {
        let now = self.timers.scheduler().now();
        let at = when.into().resolve(now)?.max(now);

        if self.timers.has_timer(target) {
            debug!(target, "Replacing pending deferred value");
            self.timers.cancel(target);
        }

        let sink = Arc::clone(&self.sink);
        let name = target.to_string();
        self.timers.check(
            target,
            at,
            CheckOptions::new().on_fire(move || {
                trace!(target = %name, "Delivering deferred value");
                sink(&name, value);
            }),
        )
    }

    /// Drop the value pending for `target`, if any.
    pub fn cancel(&self, target: &str) {
        self.timers.cancel(target);
    }

    pub fn cancel_all(&self) {
        self.timers.cancel_all();
    }

    pub fn is_pending(&self, target: &str) -> bool {
        self.timers.has_timer(target)
    }

    /// Targets with a value pending.
    pub fn targets(&self) -> Vec<String> {
        self.timers.keys()
    }
}

impl<S: Scheduler, T> std::fmt::Debug for Deferred<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("pending", &self.timers.len())
            .finish()
    }
}
