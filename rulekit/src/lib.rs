//! Timer utilities for home-automation rules.
//!
//! The core is [`TimerRegistry`]: named timers, at most one per key, with a
//! choice between debouncing (push the timer back on every repeat) and
//! flapping detection (cancel the timer when a repeat arrives). The other
//! modules are small building blocks rules tend to need alongside it.

pub mod config;
pub mod countdown;
pub mod debounce;
pub mod deferred;
pub mod ephem_tod;
pub mod error;
pub mod expire;
pub mod gatekeeper;
pub mod hysteresis;
pub mod looping;
pub mod multi_press;
pub mod rate_limit;
pub mod registry;
pub mod scheduler;
pub mod tracing;
pub mod when;

pub use error::{Error, Result};
pub use registry::{CheckOptions, TimerRegistry};
pub use scheduler::{Clock, ManualScheduler, Scheduler, SchedulerError, TokioScheduler};
pub use when::When;
