//! Error types shared across the crate.

use crate::scheduler::SchedulerError;

/// Errors surfaced by rulekit operations.
///
/// Benign races (cancelling a job that already ran, a job firing after its
/// entry was removed) are not errors and never show up here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A `when` value could not be parsed or falls outside the representable
    /// range once resolved against the clock.
    #[error("invalid time format: {0}")]
    InvalidTimeFormat(String),

    /// The scheduler refused the job. The caller decides whether to retry.
    #[error("scheduler unavailable: {0}")]
    SchedulerUnavailable(#[from] SchedulerError),

    /// A configuration value or metadata block is malformed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
