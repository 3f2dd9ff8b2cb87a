//! Return an item to a fixed state after it has been left alone for a while.
//!
//! Each item carries an expire string in its metadata:
//!
//! ```text
//! <duration>[,[command=|state=]<state>]
//! ```
//!
//! Every change to the item restarts its timer. When the timer runs out, the
//! item is updated (or commanded) to the expire state, `UNDEF` by default.
//!
//! ```
//! use std::time::Duration;
//! use rulekit::expire::{ExpireAction, ExpireConfig, ItemState};
//!
//! let config: ExpireConfig = "1h,command=STOP".parse().unwrap();
//! assert_eq!(config.timeout, Duration::from_secs(3600));
//! assert_eq!(config.action, ExpireAction::Command);
//! assert_eq!(config.state, ItemState::from("STOP"));
//! ```
//!
//! `UNDEF` and `NULL` name the undefined states. Quote them (`'UNDEF'`) to
//! get the literal strings; `''` is the empty string.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::deferred::Deferred;
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use crate::tracing::prelude::*;
use crate::when::parse_duration;

/// The state of an item as rules see it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemState {
    /// The item's value is unknown.
    Undef,
    /// The item has never had a value.
    Null,
    Value(String),
}

impl ItemState {
    pub fn is_undefined(&self) -> bool {
        matches!(self, ItemState::Undef | ItemState::Null)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Undef => f.write_str("UNDEF"),
            ItemState::Null => f.write_str("NULL"),
            ItemState::Value(value) => f.write_str(value),
        }
    }
}

impl From<&str> for ItemState {
    fn from(value: &str) -> Self {
        ItemState::Value(value.to_string())
    }
}

impl From<String> for ItemState {
    fn from(value: String) -> Self {
        ItemState::Value(value)
    }
}

/// How the expire state reaches the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum ExpireAction {
    #[strum(serialize = "state")]
    Update,
    #[strum(serialize = "command")]
    Command,
}

/// A parsed expire string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpireConfig {
    pub timeout: Duration,
    pub action: ExpireAction,
    pub state: ItemState,
}

impl FromStr for ExpireConfig {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let (duration, rest) = match raw.split_once(',') {
            Some((duration, rest)) => (duration.trim(), Some(rest)),
            None => (raw.trim(), None),
        };

        if duration.is_empty() {
            return Err(invalid(raw, "missing duration"));
        }
        let timeout = parse_duration(duration).map_err(|e| invalid(raw, e))?;

        let (action, state) = match rest {
            None => (ExpireAction::Update, ItemState::Undef),
            Some(rest) => match rest.split_once('=') {
                Some((action, state)) => {
                    let action = action.trim().to_ascii_lowercase();
                    let action = action
                        .parse::<ExpireAction>()
                        .map_err(|_| invalid(raw, format!("unrecognised action {action:?}")))?;
                    (action, parse_state(state))
                }
                None => (ExpireAction::Update, parse_state(rest)),
            },
        };

        if action == ExpireAction::Command && state.is_undefined() {
            return Err(invalid(raw, format!("cannot command an item to {state}")));
        }

        Ok(Self {
            timeout,
            action,
            state,
        })
    }
}

fn parse_state(raw: &str) -> ItemState {
    let trimmed = raw.trim();
    match trimmed {
        "" | "UNDEF" => ItemState::Undef,
        "NULL" => ItemState::Null,
        _ => {
            let unquoted = trimmed
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
                .unwrap_or(trimmed);
            ItemState::Value(unquoted.to_string())
        }
    }
}

fn invalid(raw: &str, reason: impl fmt::Display) -> Error {
    Error::InvalidConfig(format!("expire {raw:?}: {reason}"))
}

/// What to do to an item whose timer ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub action: ExpireAction,
    pub state: ItemState,
}

/// Tracks expire timers for any number of items.
pub struct Expirer<S: Scheduler> {
    deferred: Deferred<S, Expiry>,
}

impl<S: Scheduler> Expirer<S> {
    /// `sink` receives the item name and what to do to it when its timer
    /// runs out.
    pub fn new(scheduler: S, sink: impl Fn(&str, Expiry) + Send + Sync + 'static) -> Self {
        Self {
            deferred: Deferred::new(scheduler, sink),
        }
    }

    /// Handle `item` changing to `state`.
    ///
    /// Undefined states and the expire state itself stop the timer. Anything
    /// else (re)starts it.
    pub fn update(&self, item: &str, state: &ItemState, config: &ExpireConfig) -> Result<()> {
        if state.is_undefined() {
            debug!(item, %state, "Item is undefined, cancelling expiry");
            self.deferred.cancel(item);
            return Ok(());
        }

        if *state == config.state {
            debug!(item, %state, "Item is already in its expire state, cancelling expiry");
            self.deferred.cancel(item);
            return Ok(());
        }

        debug!(
            item,
            timeout = ?config.timeout,
            action = %config.action,
            expire_state = %config.state,
            "Scheduling expiry"
        );
        let expiry = Expiry {
            action: config.action,
            state: config.state.clone(),
        };
        self.deferred.defer(item, expiry, config.timeout)
    }

    /// Like [`update`](Self::update), parsing the expire string first. A bad
    /// string cancels any running timer for `item`.
    pub fn update_metadata(&self, item: &str, state: &ItemState, metadata: &str) -> Result<()> {
        let config = metadata.parse::<ExpireConfig>().inspect_err(|e| {
            error!(item, "Invalid expire config: {e}");
            self.deferred.cancel(item);
        })?;
        self.update(item, state, &config)
    }

    /// Cancel timers for every item not in `items`, e.g. after reloading
    /// metadata.
    pub fn retain<I: AsRef<str>>(&self, items: &[I]) {
        for target in self.deferred.targets() {
            if !items.iter().any(|item| item.as_ref() == target) {
                debug!(item = %target, "No longer expiring, cancelling");
                self.deferred.cancel(&target);
            }
        }
    }

    pub fn cancel(&self, item: &str) {
        self.deferred.cancel(item);
    }

    pub fn cancel_all(&self) {
        self.deferred.cancel_all();
    }

    pub fn is_pending(&self, item: &str) -> bool {
        self.deferred.is_pending(item)
    }
}

impl<S: Scheduler> fmt::Debug for Expirer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expirer")
            .field("deferred", &self.deferred)
            .finish()
    }
}
