//! Tick failure policy.

#![allow(missing_docs)]

use std::fmt;

use crate::error::PeriodicError;

/// What a task does after its callback fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TickErrorPolicy {
    /// Log the failure and keep ticking.
    #[default]
    Continue,
    /// Log the failure and stop the task.
    Halt,
}

impl TickErrorPolicy {
    pub fn parse(text: &str) -> Result<Self, PeriodicError> {
        match text.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "halt" => Ok(Self::Halt),
            _ => Err(PeriodicError::InvalidConfig(
                format!("invalid task.on_error '{text}'").into(),
            )),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Halt => "halt",
        }
    }
}

impl fmt::Display for TickErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
