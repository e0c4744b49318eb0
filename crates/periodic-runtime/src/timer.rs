//! Free-standing repeating timer on a dedicated thread.

use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::{next_deadline, Clock, StopSignal};
use crate::context::TickFn;
use crate::error::PeriodicError;

/// Repeating timer that owns its own OS thread.
///
/// Ticks run sequentially on the timer thread; a failing or panicking tick
/// does not end the timer. [`StandaloneTimer::stop`]
/// returns only after the thread has exited, unless it is called from the
/// timer thread itself; in that case the thread exits as soon as the current
/// tick returns.
#[derive(Debug)]
pub struct StandaloneTimer {
    stop: StopSignal,
    thread_id: thread::ThreadId,
    join: Option<thread::JoinHandle<()>>,
}

impl StandaloneTimer {
    /// Spawn a timer that runs `handler` every `period`, first after one period.
    pub fn spawn<C: Clock + Clone>(
        name: impl Into<String>,
        clock: C,
        period: Duration,
        handler: TickFn,
    ) -> Result<Self, PeriodicError> {
        let stop = StopSignal::new();
        let stop_thread = stop.clone();
        let first = clock.now().saturating_add(period);
        let join = thread::Builder::new()
            .name(name.into())
            .spawn(move || run_timer_loop(clock, first, period, stop_thread, handler))
            .map_err(|err| PeriodicError::ThreadSpawn(err.to_string().into()))?;
        let thread_id = join.thread().id();
        Ok(Self {
            stop,
            thread_id,
            join: Some(join),
        })
    }

    /// Thread id of the timer thread.
    #[must_use]
    pub fn thread_id(&self) -> thread::ThreadId {
        self.thread_id
    }

    /// Whether stop has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_raised()
    }

    /// Stop the timer and wait for its thread to exit.
    pub fn stop(&mut self) {
        self.stop.raise();
        let Some(join) = self.join.take() else {
            return;
        };
        if thread::current().id() == self.thread_id {
            // Stopped from inside a tick; the loop exits once the tick returns.
            return;
        }
        if join.join().is_err() {
            warn!("standalone timer thread panicked");
        }
    }
}

impl Drop for StandaloneTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_timer_loop<C: Clock>(
    clock: C,
    mut deadline: Duration,
    period: Duration,
    stop: StopSignal,
    mut handler: TickFn,
) {
    loop {
        if !clock.sleep_until(deadline, &stop) {
            break;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| handler())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(%err, "periodic tick failed"),
            Err(_) => debug!("periodic tick panicked"),
        }
        if stop.is_raised() {
            break;
        }
        deadline = next_deadline(deadline, period, clock.now());
    }
    debug!("standalone timer exited");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;
    use crate::clock::ManualClock;

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let start = Instant::now();
        while !cond() {
            if start.elapsed() > Duration::from_secs(2) {
                panic!("condition not reached in time");
            }
            thread::yield_now();
        }
    }

    #[test]
    fn ticks_follow_manual_clock() {
        let clock = ManualClock::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_timer = hits.clone();
        let mut timer = StandaloneTimer::spawn(
            "timer-test",
            clock.clone(),
            Duration::from_millis(10),
            Box::new(move || {
                hits_timer.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

        assert_ne!(timer.thread_id(), thread::current().id());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        clock.advance(Duration::from_millis(10));
        wait_for(|| hits.load(Ordering::SeqCst) == 1);
        clock.advance(Duration::from_millis(10));
        wait_for(|| hits.load(Ordering::SeqCst) == 2);

        timer.stop();
        assert!(timer.is_stopped());
        clock.advance(Duration::from_millis(50));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_tick_keeps_timer_alive() {
        let clock = ManualClock::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_timer = hits.clone();
        let mut timer = StandaloneTimer::spawn(
            "timer-fail",
            clock.clone(),
            Duration::from_millis(5),
            Box::new(move || {
                hits_timer.fetch_add(1, Ordering::SeqCst);
                Err(PeriodicError::callback("boom"))
            }),
        )
        .unwrap();

        clock.advance(Duration::from_millis(5));
        wait_for(|| hits.load(Ordering::SeqCst) == 1);
        clock.advance(Duration::from_millis(5));
        wait_for(|| hits.load(Ordering::SeqCst) == 2);
        timer.stop();
    }

    #[test]
    fn panicking_tick_keeps_timer_alive() {
        let clock = ManualClock::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_timer = hits.clone();
        let mut timer = StandaloneTimer::spawn(
            "timer-panic",
            clock.clone(),
            Duration::from_millis(5),
            Box::new(move || {
                if hits_timer.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first tick exploded");
                }
                Ok(())
            }),
        )
        .unwrap();

        clock.advance(Duration::from_millis(5));
        wait_for(|| hits.load(Ordering::SeqCst) == 1);
        clock.advance(Duration::from_millis(5));
        wait_for(|| hits.load(Ordering::SeqCst) == 2);
        assert!(!timer.is_stopped());
        timer.stop();
    }
}
