//! Session-bound execution contexts.

#![allow(missing_docs)]

use std::fmt;
use std::time::Duration;

use crate::error::PeriodicError;

/// Handler invoked once per period by a backend.
pub type TickFn = Box<dyn FnMut() -> Result<(), PeriodicError> + Send + 'static>;

/// Opaque handle returned when registering a periodic callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackHandle(u64);

impl CallbackHandle {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

/// Host context that can own periodic callbacks for the lifetime of a session.
///
/// Implementations must serialize invocations of a given callback and must
/// tolerate `add`/`remove` calls issued from inside a running callback.
/// Tasks call into the context without holding their own state lock, so a
/// context may also invoke the callback from inside `add_periodic_callback`;
/// such an early invocation is ignored by the task.
pub trait ExecutionContext: Send + Sync + 'static {
    /// Whether a session is currently active.
    fn has_session(&self) -> bool;

    /// Register `callback` to run every `period`.
    fn add_periodic_callback(
        &self,
        callback: TickFn,
        period: Duration,
    ) -> Result<CallbackHandle, PeriodicError>;

    /// Unregister a callback. Unknown handles are ignored.
    fn remove_periodic_callback(&self, handle: CallbackHandle);
}
