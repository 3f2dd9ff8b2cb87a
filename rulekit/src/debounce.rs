//! Debounce item state changes before passing them on to a proxy.
//!
//! A sensor that chatters (a door contact bouncing, presence flickering)
//! gets a proxy: the debouncer forwards a new state to the proxy only once
//! the sensor has held it for the configured timeout. States not in the
//! configured list skip the wait.
//!
//! Configuration usually lives next to the item as JSON metadata:
//!
//! ```
//! use rulekit::debounce::DebounceConfig;
//!
//! let config = DebounceConfig::from_json(
//!     r#"{ "proxy": "Presence_Proxy", "timeout": "2m 30s", "states": "OFF" }"#,
//! ).unwrap();
//! assert!(config.debounces("OFF"));
//! assert!(!config.debounces("ON"));
//! ```

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::registry::{CheckOptions, TimerRegistry};
use crate::scheduler::Scheduler;
use crate::tracing::prelude::*;
use crate::when::parse_duration;

/// Debounce settings for one item.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DebounceConfig {
    /// Item that receives the debounced state.
    pub proxy: String,

    /// How long a state must hold before it is forwarded, e.g. `"2s"` or
    /// `"1m 30s"`.
    #[serde(deserialize_with = "deserialize_timeout")]
    pub timeout: Duration,

    /// States that are debounced. Others are forwarded at once. `None`
    /// debounces everything. Accepts a list or a comma-separated string.
    #[serde(default, deserialize_with = "deserialize_states")]
    pub states: Option<Vec<String>>,

    /// Forward as a command rather than a state update.
    #[serde(default)]
    pub command: bool,
}

impl DebounceConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(format!("debounce metadata: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.proxy.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "debounce metadata: proxy must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Whether a change to `state` waits for the timeout.
    pub fn debounces(&self, state: &str) -> bool {
        self.states
            .as_ref()
            .is_none_or(|states| states.iter().any(|s| s == state))
    }
}

fn deserialize_timeout<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn deserialize_states<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Vec<String>>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum States {
        List(Vec<String>),
        Csv(String),
    }

    let states = match Option::<States>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(States::List(list)) => list,
        Some(States::Csv(csv)) => csv.split(',').map(str::to_string).collect(),
    };

    Ok(Some(
        states
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    ))
}

/// A state on its way to a proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward<T> {
    /// Item whose change produced this.
    pub item: String,
    pub proxy: String,
    pub state: T,
    pub command: bool,
}

type Sink<T> = Arc<dyn Fn(Forward<T>) + Send + Sync + 'static>;

/// Forwards item states to their proxies once they have settled.
pub struct Debouncer<S: Scheduler, T> {
    timers: TimerRegistry<S>,
    sink: Sink<T>,
}

impl<S: Scheduler, T: Display + Send + 'static> Debouncer<S, T> {
    pub fn new(scheduler: S, sink: impl Fn(Forward<T>) + Send + Sync + 'static) -> Self {
        Self {
            timers: TimerRegistry::new(scheduler),
            sink: Arc::new(sink),
        }
    }

    /// Handle a state change on `item`.
    ///
    /// Any wait already running for `item` is abandoned. A debounced state
    /// is forwarded after `config.timeout` unless another change arrives
    /// first; any other state is forwarded before this returns.
    pub fn update(&self, item: &str, state: T, config: &DebounceConfig) -> Result<()> {
        self.timers.cancel(item);

        let forward = Forward {
            item: item.to_string(),
            proxy: config.proxy.clone(),
            state,
            command: config.command,
        };

        let label = forward.state.to_string();
        if !config.debounces(&label) {
            debug!(item, state = %label, "State not debounced, forwarding");
            (self.sink)(forward);
            return Ok(());
        }

        debug!(
            item,
            state = %label,
            proxy = %config.proxy,
            timeout = ?config.timeout,
            "Debouncing"
        );
        let sink = Arc::clone(&self.sink);
        self.timers.check(
            item,
            config.timeout,
            CheckOptions::new().on_fire(move || sink(forward)),
        )
    }

    /// Cancel waits for every item not in `items`, e.g. after reloading
    /// configuration.
    pub fn retain<I: AsRef<str>>(&self, items: &[I]) {
        for key in self.timers.keys() {
            if !items.iter().any(|item| item.as_ref() == key) {
                debug!(item = %key, "No longer debounced, cancelling");
                self.timers.cancel(&key);
            }
        }
    }

    pub fn cancel_all(&self) {
        self.timers.cancel_all();
    }

    /// Whether a state for `item` is waiting out its timeout.
    pub fn is_pending(&self, item: &str) -> bool {
        self.timers.has_timer(item)
    }
}

impl<S: Scheduler, T> std::fmt::Debug for Debouncer<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("pending", &self.timers.len())
            .finish()
    }
}
