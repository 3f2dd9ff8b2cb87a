//! Logging setup.
//!
//! Library code logs through the `tracing` macros re-exported from
//! [`prelude`]. Binaries and embedding hosts call [`init`] once at startup.

use time::macros::format_description;
use tracing_subscriber::{EnvFilter, fmt::time::LocalTime, prelude::*};

use crate::config::LogConfig;

pub mod prelude {
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `config.filter`. When journald output is
/// requested but the journal socket can't be reached, falls back to
/// formatted output on stderr.
pub fn init(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter.as_str()));

    if config.journald {
        match tracing_journald::layer() {
            Ok(journald) => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(journald)
                    .init();
                return;
            }
            Err(e) => {
                init_stderr(filter);
                warn!("journald unavailable, logging to stderr: {e}");
                return;
            }
        }
    }

    init_stderr(filter);
}

fn init_stderr(filter: EnvFilter) {
    let timer = LocalTime::new(format_description!(
        "[hour]:[minute]:[second].[subsecond digits:3]"
    ));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(timer)
                .with_writer(std::io::stderr),
        )
        .init();
}
