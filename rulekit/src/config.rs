//! Process-level configuration.

use std::env;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::when::parse_duration;

const ENV_LOG: &str = "RULEKIT_LOG";
const ENV_JOURNALD: &str = "RULEKIT_JOURNALD";
const ENV_COUNTDOWN_TICK: &str = "RULEKIT_COUNTDOWN_TICK";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Default filter directive, e.g. `info` or `rulekit=debug`. Overridden
    /// by `RUST_LOG` when that is set.
    pub filter: String,

    /// Send log records to the systemd journal instead of stderr.
    pub journald: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            journald: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub log: LogConfig,

    /// Interval between remaining-time reports from a
    /// [`CountdownTimer`](crate::countdown::CountdownTimer).
    pub countdown_tick: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            countdown_tick: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Build a config from defaults overlaid with `RULEKIT_*` environment
    /// variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(filter) = lookup(ENV_LOG) {
            config.log.filter = filter;
        }

        if let Some(value) = lookup(ENV_JOURNALD) {
            config.log.journald = parse_flag(ENV_JOURNALD, &value)?;
        }

        if let Some(value) = lookup(ENV_COUNTDOWN_TICK) {
            let tick = parse_duration(&value)
                .map_err(|e| Error::InvalidConfig(format!("{ENV_COUNTDOWN_TICK}: {e}")))?;
            if tick.is_zero() {
                return Err(Error::InvalidConfig(format!(
                    "{ENV_COUNTDOWN_TICK} must be greater than zero"
                )));
            }
            config.countdown_tick = tick;
        }

        Ok(config)
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::InvalidConfig(format!(
            "{name}: expected a boolean, got {other:?}"
        ))),
    }
}
