//! `periodic-runtime` - periodic callback scheduling with session-bound and
//! standalone timer backends.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

/// Process-wide busy indicator.
pub mod busy;
/// Scheduling clocks and stop signals.
pub mod clock;
/// Task configuration loading.
pub mod config;
/// Session-bound execution contexts.
pub mod context;
/// Scheduler errors.
pub mod error;
/// Tick failure policy.
pub mod policy;
/// Cooperative session loop.
pub mod session;
/// Periodic task state machine.
pub mod task;
/// Free-standing repeating timer.
pub mod timer;

pub use busy::BusyFlag;
pub use clock::{Clock, ManualClock, StdClock, StopSignal};
pub use config::TaskConfig;
pub use context::{CallbackHandle, ExecutionContext, TickFn};
pub use error::PeriodicError;
pub use policy::TickErrorPolicy;
pub use session::SessionLoop;
pub use task::{BackendKind, PeriodicTask, PeriodicTaskBuilder, TaskSnapshot};
pub use timer::StandaloneTimer;
