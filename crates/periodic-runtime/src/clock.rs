//! Scheduling clocks and stop signals.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Granularity at which manual-clock sleepers re-check their stop signal.
const MANUAL_POLL: Duration = Duration::from_millis(1);

/// Clock interface for periodic scheduling.
pub trait Clock: Send + Sync + 'static {
    /// Time elapsed since the clock origin.
    fn now(&self) -> Duration;

    /// Sleep until `deadline` or until `stop` is raised.
    ///
    /// Returns `false` when the sleep was cut short by `stop`.
    fn sleep_until(&self, deadline: Duration, stop: &StopSignal) -> bool;
}

/// Cloneable one-shot flag used to interrupt a sleeping timer.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake every waiter.
    pub fn raise(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock() = true;
        cvar.notify_all();
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Wait up to `timeout`; returns `true` if the signal was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut raised = lock.lock();
        if *raised {
            return true;
        }
        let _ = cvar.wait_for(&mut raised, timeout);
        *raised
    }
}

/// Monotonic clock based on `std::time::Instant`.
#[derive(Debug, Clone)]
pub struct StdClock {
    start: Instant,
}

impl StdClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep_until(&self, deadline: Duration, stop: &StopSignal) -> bool {
        loop {
            let now = self.now();
            if now >= deadline {
                return !stop.is_raised();
            }
            if stop.wait_timeout(deadline - now) {
                return false;
            }
        }
    }
}

#[derive(Debug)]
struct ManualClockState {
    now: Duration,
    sleep_calls: u64,
}

/// Deterministic clock for tests and simulations.
///
/// Time only moves when [`ManualClock::advance`] or
/// [`ManualClock::set_time`] is called.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<(Mutex<ManualClockState>, Condvar)>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new((
                Mutex::new(ManualClockState {
                    now: Duration::ZERO,
                    sleep_calls: 0,
                }),
                Condvar::new(),
            )),
        }
    }

    /// Return the current manual time.
    #[must_use]
    pub fn current_time(&self) -> Duration {
        self.inner.0.lock().now
    }

    /// Advance time by the given delta.
    pub fn advance(&self, delta: Duration) -> Duration {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock();
        state.now = state.now.saturating_add(delta);
        cvar.notify_all();
        state.now
    }

    /// Set the current time explicitly.
    pub fn set_time(&self, time: Duration) {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock();
        state.now = time;
        cvar.notify_all();
    }

    /// Number of sleep calls issued to this clock.
    #[must_use]
    pub fn sleep_calls(&self) -> u64 {
        self.inner.0.lock().sleep_calls
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.current_time()
    }

    fn sleep_until(&self, deadline: Duration, stop: &StopSignal) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock();
        state.sleep_calls = state.sleep_calls.saturating_add(1);
        loop {
            if stop.is_raised() {
                return false;
            }
            if state.now >= deadline {
                return true;
            }
            // The stop signal has its own condvar, so poll it.
            let _ = cvar.wait_for(&mut state, MANUAL_POLL);
        }
    }
}

/// Next deadline after a tick at `now`, skipping periods that were missed.
///
/// A deadline landing exactly on `now` is kept and fires right away.
pub(crate) fn next_deadline(deadline: Duration, period: Duration, now: Duration) -> Duration {
    let next = deadline.saturating_add(period);
    if next >= now {
        next
    } else {
        now.saturating_add(period)
    }
}
