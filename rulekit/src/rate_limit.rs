//! Drop calls that arrive too soon after the last accepted one.

use time::OffsetDateTime;

use crate::error::Result;
use crate::scheduler::Clock;
use crate::tracing::prelude::*;
use crate::when::When;

/// Runs a closure at most once per window.
///
/// Each accepted call opens a new window ending at the `when` passed with
/// it; calls before that instant are ignored rather than queued.
#[derive(Debug)]
pub struct RateLimit<C: Clock> {
    clock: C,
    until: Option<OffsetDateTime>,
}

impl<C: Clock> RateLimit<C> {
    pub fn new(clock: C) -> Self {
        Self { clock, until: None }
    }

    /// Run `f` unless still inside the current window. Returns whether `f`
    /// ran.
    ///
    /// An unresolvable `when` is reported before `f` runs, and leaves the
    /// current window unchanged.
    pub fn run(&mut self, when: impl Into<When>, f: impl FnOnce()) -> Result<bool> {
        let now = self.clock.now();

        if let Some(until) = self.until {
            if now <= until {
                trace!(%until, "Rate limited, call dropped");
                return Ok(false);
            }
        }

        self.until = Some(when.into().resolve(now)?);
        f();
        Ok(true)
    }

    /// End of the current window, if one has been opened.
    pub fn until(&self) -> Option<OffsetDateTime> {
        self.until
    }
}
