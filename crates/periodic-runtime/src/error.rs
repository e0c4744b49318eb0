//! Scheduler errors.

#![allow(missing_docs)]

use smol_str::SmolStr;
use thiserror::Error;

/// Errors raised by periodic tasks and their backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeriodicError {
    /// start() was called while a timer is already armed.
    #[error("periodic callback has already started")]
    AlreadyRunning,

    /// start() was called before a callback was configured.
    #[error("periodic callback is not configured")]
    MissingCallback,

    /// Period must be strictly positive.
    #[error("invalid period {0} ms (must be > 0)")]
    InvalidPeriod(u64),

    /// Configuration error.
    #[error("invalid config '{0}'")]
    InvalidConfig(SmolStr),

    /// The user callback failed during a tick.
    #[error("periodic callback failed: {0}")]
    Callback(SmolStr),

    /// The execution context has no active session.
    #[error("execution context has no active session")]
    SessionClosed,

    /// Timer thread spawn error.
    #[error("thread spawn error '{0}'")]
    ThreadSpawn(SmolStr),
}

impl PeriodicError {
    /// Wrap any displayable callback failure.
    pub fn callback(err: impl std::fmt::Display) -> Self {
        Self::Callback(err.to_string().into())
    }
}
