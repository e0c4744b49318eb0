//! Cooperative single-threaded session loop.
//!
//! A [`SessionLoop`] owns the periodic callbacks registered while its session
//! is open. The host drives it by calling [`SessionLoop::run_pending`] (or
//! [`SessionLoop::run_for`]) from one thread, so every callback runs on that
//! thread and never overlaps with itself. Closing the session drops every
//! registered callback.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::clock::{next_deadline, Clock, StdClock, StopSignal};
use crate::context::{CallbackHandle, ExecutionContext, TickFn};
use crate::error::PeriodicError;

struct Entry {
    period: Duration,
    deadline: Duration,
    // Taken out while the callback runs so the loop lock is not held.
    callback: Option<TickFn>,
}

struct LoopState {
    open: bool,
    next_id: u64,
    entries: BTreeMap<CallbackHandle, Entry>,
}

/// Event loop implementing [`ExecutionContext`].
pub struct SessionLoop<C: Clock + Clone = StdClock> {
    clock: C,
    state: Mutex<LoopState>,
}

impl<C: Clock + Clone> SessionLoop<C> {
    /// Create a loop with an open session.
    #[must_use]
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            state: Mutex::new(LoopState {
                open: true,
                next_id: 1,
                entries: BTreeMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn open_session(&self) {
        self.state.lock().open = true;
    }

    /// Close the session and drop all registered callbacks.
    pub fn close_session(&self) {
        let dropped = {
            let mut state = self.state.lock();
            state.open = false;
            std::mem::take(&mut state.entries)
        };
        debug!(callbacks = dropped.len(), "session closed");
        drop(dropped);
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_registered(&self, handle: CallbackHandle) -> bool {
        self.state.lock().entries.contains_key(&handle)
    }

    /// Earliest deadline among registered callbacks.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        self.state
            .lock()
            .entries
            .values()
            .map(|entry| entry.deadline)
            .min()
    }

    /// Run every callback whose deadline has passed, in deadline order.
    ///
    /// Each due callback runs at most once per call. The first callback
    /// failure is returned after that callback has been rescheduled; the
    /// remaining due callbacks run on the next call. A panicking callback is
    /// rescheduled before the panic is resumed, so a host that catches the
    /// unwind can keep driving the loop.
    pub fn run_pending(&self) -> Result<usize, PeriodicError> {
        let now = self.clock.now();
        let mut due: Vec<(Duration, CallbackHandle)> = {
            let state = self.state.lock();
            state
                .entries
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(handle, entry)| (entry.deadline, *handle))
                .collect()
        };
        due.sort();

        let mut ran = 0;
        for (_, handle) in due {
            let taken = {
                let mut state = self.state.lock();
                state
                    .entries
                    .get_mut(&handle)
                    .filter(|entry| entry.deadline <= now)
                    .and_then(|entry| entry.callback.take())
            };
            let Some(mut callback) = taken else {
                continue;
            };

            let result = panic::catch_unwind(AssertUnwindSafe(|| callback()));

            {
                let mut state = self.state.lock();
                // Gone if the callback unregistered itself or the session closed.
                if let Some(entry) = state.entries.get_mut(&handle) {
                    entry.callback = Some(callback);
                    entry.deadline = next_deadline(entry.deadline, entry.period, now);
                }
            }
            ran += 1;
            match result {
                Ok(result) => result?,
                Err(payload) => panic::resume_unwind(payload),
            }
        }
        Ok(ran)
    }

    /// Drive the loop against its clock for `duration`.
    ///
    /// With a [`crate::clock::ManualClock`] this blocks until another thread
    /// advances the clock past the end.
    pub fn run_for(&self, duration: Duration) -> Result<usize, PeriodicError> {
        let end = self.clock.now().saturating_add(duration);
        let never = StopSignal::new();
        let mut ran = 0;
        loop {
            ran += self.run_pending()?;
            if self.clock.now() >= end {
                return Ok(ran);
            }
            let wake = self.next_deadline().map_or(end, |deadline| deadline.min(end));
            self.clock.sleep_until(wake, &never);
        }
    }
}

impl<C: Clock + Clone> ExecutionContext for SessionLoop<C> {
    fn has_session(&self) -> bool {
        self.state.lock().open
    }

    fn add_periodic_callback(
        &self,
        callback: TickFn,
        period: Duration,
    ) -> Result<CallbackHandle, PeriodicError> {
        let deadline = self.clock.now().saturating_add(period);
        let mut state = self.state.lock();
        if !state.open {
            return Err(PeriodicError::SessionClosed);
        }
        let handle = CallbackHandle::new(state.next_id);
        state.next_id += 1;
        state.entries.insert(
            handle,
            Entry {
                period,
                deadline,
                callback: Some(callback),
            },
        );
        debug!(%handle, period_ms = period.as_millis(), "periodic callback added");
        Ok(handle)
    }

    fn remove_periodic_callback(&self, handle: CallbackHandle) {
        let removed = self.state.lock().entries.remove(&handle);
        if removed.is_some() {
            debug!(%handle, "periodic callback removed");
        }
        drop(removed);
    }
}
