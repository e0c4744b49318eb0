//! Periodic task state machine.
//!
//! A [`PeriodicTask`] invokes a callback once per period on one of two
//! backends: a session-bound [`ExecutionContext`] when one with an active
//! session is attached, otherwise a [`StandaloneTimer`] thread. The task stops
//! itself once the configured invocation count is reached or once the
//! configured timeout has elapsed since start.
//!
//! `running` can be driven either through [`PeriodicTask::start`] /
//! [`PeriodicTask::stop`] or through [`PeriodicTask::set_running`]; the
//! setter reacts to changes by calling start/stop, and start/stop mark their
//! own writes with the `updating` flag so the setter does not re-enter them.

#![allow(missing_docs)]

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use smol_str::SmolStr;
use tracing::{debug, info, warn};

use crate::busy::BusyFlag;
use crate::clock::{Clock, StdClock};
use crate::config::{validate_count, validate_period, validate_timeout, TaskConfig};
use crate::context::{CallbackHandle, ExecutionContext, TickFn};
use crate::error::PeriodicError;
use crate::policy::TickErrorPolicy;
use crate::timer::StandaloneTimer;

type BoxedCallback = Box<dyn FnMut() -> Result<(), PeriodicError> + Send>;
type SharedCallback = Arc<Mutex<BoxedCallback>>;

fn share_callback<F, E>(mut callback: F) -> SharedCallback
where
    F: FnMut() -> Result<(), E> + Send + 'static,
    E: fmt::Display,
{
    let boxed: BoxedCallback = Box::new(move || callback().map_err(PeriodicError::callback));
    Arc::new(Mutex::new(boxed))
}

/// Which backend currently drives a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Session,
    Standalone,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => f.write_str("session"),
            Self::Standalone => f.write_str("standalone"),
        }
    }
}

enum Backend {
    Session {
        context: Arc<dyn ExecutionContext>,
        handle: CallbackHandle,
    },
    Standalone(StandaloneTimer),
}

impl Backend {
    fn kind(&self) -> BackendKind {
        match self {
            Self::Session { .. } => BackendKind::Session,
            Self::Standalone(_) => BackendKind::Standalone,
        }
    }

    /// Must not be called with the task lock held: stopping a standalone
    /// timer joins its thread.
    fn release(self) {
        match self {
            Self::Session { context, handle } => context.remove_periodic_callback(handle),
            Self::Standalone(mut timer) => timer.stop(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Expiry {
    Timeout,
    Count,
}

struct TaskState {
    callback: Option<SharedCallback>,
    period: Duration,
    count: Option<u64>,
    timeout: Option<Duration>,
    on_error: TickErrorPolicy,
    context: Option<Arc<dyn ExecutionContext>>,
    running: bool,
    counter: u64,
    start_time: Option<Duration>,
    backend: Option<Backend>,
    updating: bool,
    // Set while arm() registers with a backend outside the lock.
    arming: bool,
    // Bumped on every arm and stop; ticks carry the epoch they were armed with.
    epoch: u64,
    last_error: Option<PeriodicError>,
}

impl TaskState {
    fn is_armed(&self, epoch: u64) -> bool {
        self.backend.is_some() && self.epoch == epoch
    }
}

struct Inner<C: Clock + Clone> {
    name: SmolStr,
    clock: C,
    busy: BusyFlag,
    state: Mutex<TaskState>,
}

impl<C: Clock + Clone> Drop for Inner<C> {
    fn drop(&mut self) {
        if let Some(backend) = self.state.get_mut().backend.take() {
            backend.release();
        }
    }
}

/// Sets `updating` for its lifetime.
struct UpdatingGuard<'a, C: Clock + Clone> {
    inner: &'a Inner<C>,
}

impl<'a, C: Clock + Clone> UpdatingGuard<'a, C> {
    fn new(inner: &'a Inner<C>) -> Self {
        inner.state.lock().updating = true;
        Self { inner }
    }
}

impl<C: Clock + Clone> Drop for UpdatingGuard<'_, C> {
    fn drop(&mut self) {
        self.inner.state.lock().updating = false;
    }
}

/// Serializable view of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    pub name: SmolStr,
    pub running: bool,
    pub counter: u64,
    pub period_ms: u64,
    pub count: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub on_error: SmolStr,
    pub backend: Option<BackendKind>,
    pub last_error: Option<String>,
}

/// Callback scheduled at a fixed period.
///
/// Cloning yields another handle to the same task. The backend holds only a
/// weak reference, so dropping every handle releases the timer.
pub struct PeriodicTask<C: Clock + Clone = StdClock> {
    inner: Arc<Inner<C>>,
}

impl<C: Clock + Clone> Clone for PeriodicTask<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl PeriodicTask<StdClock> {
    /// Builder using the monotonic system clock.
    #[must_use]
    pub fn builder() -> PeriodicTaskBuilder<StdClock> {
        PeriodicTaskBuilder::new(StdClock::new())
    }
}

impl<C: Clock + Clone> PeriodicTask<C> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Invocations since the last start.
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.inner.state.lock().counter
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.inner.state.lock().period
    }

    #[must_use]
    pub fn count(&self) -> Option<u64> {
        self.inner.state.lock().count
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.state.lock().timeout
    }

    #[must_use]
    pub fn on_error(&self) -> TickErrorPolicy {
        self.inner.state.lock().on_error
    }

    #[must_use]
    pub fn busy_flag(&self) -> &BusyFlag {
        &self.inner.busy
    }

    /// Backend of the currently armed timer.
    #[must_use]
    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.inner.state.lock().backend.as_ref().map(Backend::kind)
    }

    /// Context the armed timer is bound to, if the session backend is used.
    #[must_use]
    pub fn bound_context(&self) -> Option<Arc<dyn ExecutionContext>> {
        match self.inner.state.lock().backend.as_ref() {
            Some(Backend::Session { context, .. }) => Some(context.clone()),
            _ => None,
        }
    }

    /// Most recent callback failure.
    #[must_use]
    pub fn last_error(&self) -> Option<PeriodicError> {
        self.inner.state.lock().last_error.clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.inner.state.lock();
        TaskSnapshot {
            name: self.inner.name.clone(),
            running: state.running,
            counter: state.counter,
            period_ms: millis(state.period),
            count: state.count,
            timeout_ms: state.timeout.map(millis),
            on_error: SmolStr::new(state.on_error.as_str()),
            backend: state.backend.as_ref().map(Backend::kind),
            last_error: state.last_error.as_ref().map(ToString::to_string),
        }
    }

    /// Replace the callback; takes effect on the next tick.
    pub fn set_callback<F, E>(&self, callback: F)
    where
        F: FnMut() -> Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        self.inner.state.lock().callback = Some(share_callback(callback));
    }

    pub fn set_count(&self, count: Option<u64>) -> Result<(), PeriodicError> {
        validate_count(count)?;
        self.inner.state.lock().count = count;
        Ok(())
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), PeriodicError> {
        validate_timeout(timeout)?;
        self.inner.state.lock().timeout = timeout;
        Ok(())
    }

    pub fn set_on_error(&self, policy: TickErrorPolicy) {
        self.inner.state.lock().on_error = policy;
    }

    /// Attach or detach the execution context consulted on the next start.
    pub fn set_context(&self, context: Option<Arc<dyn ExecutionContext>>) {
        self.inner.state.lock().context = context;
    }

    /// Change the period. An armed task is restarted so the new period applies
    /// immediately; this resets the counter.
    pub fn set_period(&self, period: Duration) -> Result<(), PeriodicError> {
        validate_period(period)?;
        let armed = {
            let mut state = self.inner.state.lock();
            if state.period == period {
                return Ok(());
            }
            state.period = period;
            state.backend.is_some()
        };
        if armed {
            debug!(task = %self.inner.name, period_ms = millis(period), "period changed, restarting");
            self.stop();
            self.start()?;
        }
        Ok(())
    }

    /// Set `running`, starting or stopping the task when the value changes.
    pub fn set_running(&self, running: bool) -> Result<(), PeriodicError> {
        if !self.write_running(running) {
            return Ok(());
        }
        if !running {
            self.stop();
            return Ok(());
        }
        let result = self.start();
        if matches!(result, Err(ref err) if *err != PeriodicError::AlreadyRunning) {
            self.clear_running();
        }
        result
    }

    /// Arm the timer.
    ///
    /// Fails with [`PeriodicError::AlreadyRunning`] when a timer is already
    /// armed and with [`PeriodicError::MissingCallback`] when no callback is
    /// set.
    pub fn start(&self) -> Result<(), PeriodicError> {
        let running = {
            let state = self.inner.state.lock();
            if state.backend.is_some() {
                return Err(PeriodicError::AlreadyRunning);
            }
            if state.callback.is_none() {
                return Err(PeriodicError::MissingCallback);
            }
            state.running
        };
        if !running {
            let _updating = UpdatingGuard::new(&self.inner);
            let reacts = self.write_running(true);
            debug_assert!(!reacts);
        }
        let result = self.arm();
        if matches!(result, Err(ref err) if *err != PeriodicError::AlreadyRunning) {
            self.clear_running();
        }
        result
    }

    /// Disarm the timer and reset the counter. Never fails.
    pub fn stop(&self) {
        let running = self.inner.state.lock().running;
        if running {
            self.clear_running();
        }
        let backend = {
            let mut state = self.inner.state.lock();
            state.counter = 0;
            state.epoch = state.epoch.wrapping_add(1);
            state.backend.take()
        };
        if let Some(backend) = backend {
            let kind = backend.kind();
            backend.release();
            info!(task = %self.inner.name, backend = %kind, "periodic task stopped");
        }
    }

    /// Returns whether the change should trigger start/stop.
    fn write_running(&self, running: bool) -> bool {
        let mut state = self.inner.state.lock();
        if state.running == running {
            return false;
        }
        state.running = running;
        !state.updating
    }

    fn clear_running(&self) {
        let _updating = UpdatingGuard::new(&self.inner);
        let reacts = self.write_running(false);
        debug_assert!(!reacts);
    }

    /// Registers with the backend without holding the task lock, so a context
    /// may run the tick or query the task from inside registration.
    fn arm(&self) -> Result<(), PeriodicError> {
        let (epoch, period, context) = {
            let mut state = self.inner.state.lock();
            if state.backend.is_some() || state.arming {
                return Err(PeriodicError::AlreadyRunning);
            }
            state.arming = true;
            state.start_time = Some(self.inner.clock.now());
            state.epoch = state.epoch.wrapping_add(1);
            (state.epoch, state.period, state.context.clone())
        };

        let session = context.filter(|context| context.has_session());
        let backend = match session {
            Some(context) => context
                .add_periodic_callback(self.tick_fn(epoch), period)
                .map(|handle| Backend::Session { context, handle }),
            None => StandaloneTimer::spawn(
                format!("periodic:{}", self.inner.name),
                self.inner.clock.clone(),
                period,
                self.tick_fn(epoch),
            )
            .map(Backend::Standalone),
        };

        let mut state = self.inner.state.lock();
        state.arming = false;
        let backend = backend?;
        if state.epoch != epoch {
            // Stopped while registering.
            drop(state);
            backend.release();
            return Ok(());
        }
        info!(
            task = %self.inner.name,
            backend = %backend.kind(),
            period_ms = millis(period),
            "periodic task started"
        );
        state.backend = Some(backend);
        Ok(())
    }

    fn tick_fn(&self, epoch: u64) -> TickFn {
        let weak: Weak<Inner<C>> = Arc::downgrade(&self.inner);
        Box::new(move || {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            let task = PeriodicTask { inner };
            match panic::catch_unwind(AssertUnwindSafe(|| task.tick(epoch))) {
                Ok(result) => {
                    if let Err(err) = &result {
                        task.record_failure(epoch, err);
                    }
                    result
                }
                Err(payload) => {
                    let err = PeriodicError::callback(format!(
                        "panicked: {}",
                        panic_message(payload.as_ref())
                    ));
                    task.record_failure(epoch, &err);
                    panic::resume_unwind(payload)
                }
            }
        })
    }

    /// One invocation: busy on, callback, busy off, bookkeeping.
    fn tick(&self, epoch: u64) -> Result<(), PeriodicError> {
        let callback = {
            let state = self.inner.state.lock();
            if !state.is_armed(epoch) {
                return Ok(());
            }
            state.callback.clone()
        };
        let Some(callback) = callback else {
            return Ok(());
        };

        {
            let _busy = self.inner.busy.enter();
            let mut guard = callback.lock();
            let run = &mut *guard;
            run()?;
        }

        let expired = {
            let mut state = self.inner.state.lock();
            // Stopped or restarted from inside the callback.
            if !state.is_armed(epoch) {
                return Ok(());
            }
            state.counter += 1;
            let elapsed = state
                .start_time
                .map(|start| self.inner.clock.now().saturating_sub(start));
            match (state.timeout, elapsed) {
                (Some(timeout), Some(elapsed)) if elapsed > timeout => Some(Expiry::Timeout),
                _ if state.count == Some(state.counter) => Some(Expiry::Count),
                _ => None,
            }
        };
        if let Some(reason) = expired {
            debug!(task = %self.inner.name, ?reason, "periodic task expired");
            self.stop();
        }
        Ok(())
    }

    fn record_failure(&self, epoch: u64, err: &PeriodicError) {
        let halt = {
            let mut state = self.inner.state.lock();
            state.last_error = Some(err.clone());
            state.is_armed(epoch) && state.on_error == TickErrorPolicy::Halt
        };
        warn!(task = %self.inner.name, %err, halt, "periodic callback failed");
        if halt {
            self.stop();
        }
    }
}

impl<C: Clock + Clone> fmt::Debug for PeriodicTask<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("PeriodicTask")
            .field("name", &snapshot.name)
            .field("running", &snapshot.running)
            .field("counter", &snapshot.counter)
            .field("period_ms", &snapshot.period_ms)
            .field("backend", &snapshot.backend)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Builder for [`PeriodicTask`].
pub struct PeriodicTaskBuilder<C: Clock + Clone> {
    clock: C,
    config: TaskConfig,
    callback: Option<SharedCallback>,
    context: Option<Arc<dyn ExecutionContext>>,
    busy: Option<BusyFlag>,
}

impl<C: Clock + Clone> PeriodicTaskBuilder<C> {
    #[must_use]
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            config: TaskConfig::default(),
            callback: None,
            context: None,
            busy: None,
        }
    }

    /// Switch to another clock, keeping everything else.
    #[must_use]
    pub fn with_clock<D: Clock + Clone>(self, clock: D) -> PeriodicTaskBuilder<D> {
        PeriodicTaskBuilder {
            clock,
            config: self.config,
            callback: self.callback,
            context: self.context,
            busy: self.busy,
        }
    }

    /// Apply a loaded configuration.
    #[must_use]
    pub fn config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<SmolStr>) -> Self {
        self.config.name = name.into();
        self
    }

    #[must_use]
    pub fn callback<F, E>(mut self, callback: F) -> Self
    where
        F: FnMut() -> Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        self.callback = Some(share_callback(callback));
        self
    }

    #[must_use]
    pub fn period(mut self, period: Duration) -> Self {
        self.config.period = period;
        self
    }

    #[must_use]
    pub fn period_ms(self, period_ms: u64) -> Self {
        self.period(Duration::from_millis(period_ms))
    }

    #[must_use]
    pub fn count(mut self, count: u64) -> Self {
        self.config.count = Some(count);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn timeout_ms(self, timeout_ms: u64) -> Self {
        self.timeout(Duration::from_millis(timeout_ms))
    }

    /// Start immediately on [`PeriodicTaskBuilder::build`].
    #[must_use]
    pub fn running(mut self, running: bool) -> Self {
        self.config.running = running;
        self
    }

    #[must_use]
    pub fn on_error(mut self, policy: TickErrorPolicy) -> Self {
        self.config.on_error = policy;
        self
    }

    #[must_use]
    pub fn context(mut self, context: Arc<dyn ExecutionContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Use an isolated busy flag instead of [`BusyFlag::global`].
    #[must_use]
    pub fn busy_flag(mut self, busy: BusyFlag) -> Self {
        self.busy = Some(busy);
        self
    }

    pub fn build(self) -> Result<PeriodicTask<C>, PeriodicError> {
        let config = self.config;
        validate_period(config.period)?;
        validate_count(config.count)?;
        validate_timeout(config.timeout)?;
        let task = PeriodicTask {
            inner: Arc::new(Inner {
                name: config.name,
                clock: self.clock,
                busy: self.busy.unwrap_or_else(BusyFlag::global),
                state: Mutex::new(TaskState {
                    callback: self.callback,
                    period: config.period,
                    count: config.count,
                    timeout: config.timeout,
                    on_error: config.on_error,
                    context: self.context,
                    running: false,
                    counter: 0,
                    start_time: None,
                    backend: None,
                    updating: false,
                    arming: false,
                    epoch: 0,
                    last_error: None,
                }),
            }),
        };
        if config.running {
            task.set_running(true)?;
        }
        Ok(task)
    }
}
