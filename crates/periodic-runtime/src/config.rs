//! Task configuration loading.

#![allow(missing_docs)]

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use smol_str::SmolStr;

use crate::error::PeriodicError;
use crate::policy::TickErrorPolicy;

pub const DEFAULT_PERIOD_MS: u64 = 500;
pub const DEFAULT_TASK_NAME: &str = "periodic";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    pub name: SmolStr,
    pub period: Duration,
    pub count: Option<u64>,
    pub timeout: Option<Duration>,
    pub running: bool,
    pub on_error: TickErrorPolicy,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: SmolStr::new_inline(DEFAULT_TASK_NAME),
            period: Duration::from_millis(DEFAULT_PERIOD_MS),
            count: None,
            timeout: None,
            running: false,
            on_error: TickErrorPolicy::default(),
        }
    }
}

impl TaskConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PeriodicError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            PeriodicError::InvalidConfig(format!("{}: {err}", path.display()).into())
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, PeriodicError> {
        let raw: TaskToml = toml::from_str(text)
            .map_err(|err| PeriodicError::InvalidConfig(format!("task config: {err}").into()))?;
        raw.task.into_config()
    }
}

pub(crate) fn validate_period(period: Duration) -> Result<(), PeriodicError> {
    if period.is_zero() {
        return Err(PeriodicError::InvalidPeriod(0));
    }
    Ok(())
}

pub(crate) fn validate_count(count: Option<u64>) -> Result<(), PeriodicError> {
    if count == Some(0) {
        return Err(PeriodicError::InvalidConfig(
            "task.count must be greater than zero".into(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_timeout(timeout: Option<Duration>) -> Result<(), PeriodicError> {
    if timeout.is_some_and(|timeout| timeout.is_zero()) {
        return Err(PeriodicError::InvalidConfig(
            "task.timeout_ms must be greater than zero".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskToml {
    task: TaskSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskSection {
    name: Option<String>,
    period_ms: Option<u64>,
    count: Option<u64>,
    timeout_ms: Option<u64>,
    running: Option<bool>,
    on_error: Option<String>,
}

impl TaskSection {
    fn into_config(self) -> Result<TaskConfig, PeriodicError> {
        let period_ms = self.period_ms.unwrap_or(DEFAULT_PERIOD_MS);
        if period_ms == 0 {
            return Err(PeriodicError::InvalidPeriod(period_ms));
        }
        let timeout = self.timeout_ms.map(Duration::from_millis);
        validate_count(self.count)?;
        validate_timeout(timeout)?;
        let on_error = match self.on_error.as_deref() {
            Some(text) => TickErrorPolicy::parse(text)?,
            None => TickErrorPolicy::default(),
        };
        let name = match self.name {
            Some(name) if name.trim().is_empty() => {
                return Err(PeriodicError::InvalidConfig(
                    "task.name must not be empty".into(),
                ))
            }
            Some(name) => SmolStr::new(name.trim()),
            None => SmolStr::new_inline(DEFAULT_TASK_NAME),
        };
        Ok(TaskConfig {
            name,
            period: Duration::from_millis(period_ms),
            count: self.count,
            timeout,
            running: self.running.unwrap_or(false),
            on_error,
        })
    }
}
