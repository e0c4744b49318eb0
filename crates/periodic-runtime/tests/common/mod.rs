#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use periodic_runtime::{ManualClock, PeriodicTaskBuilder, SessionLoop};

pub const PERIOD: Duration = Duration::from_millis(10);

/// Poll `cond` until it holds, panicking after two seconds.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > Duration::from_secs(2) {
            panic!("{what} not reached in time");
        }
        std::thread::yield_now();
    }
}

pub fn counter() -> (Arc<AtomicU64>, impl FnMut() -> Result<(), String> + Send + 'static) {
    let hits = Arc::new(AtomicU64::new(0));
    let hits_cb = hits.clone();
    (hits, move || {
        hits_cb.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

pub fn hits(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::SeqCst)
}

/// Session loop on a manual clock plus a builder bound to it.
pub fn session_fixture() -> (
    ManualClock,
    Arc<SessionLoop<ManualClock>>,
    PeriodicTaskBuilder<ManualClock>,
) {
    let clock = ManualClock::new();
    let session = Arc::new(SessionLoop::new(clock.clone()));
    let builder = PeriodicTaskBuilder::new(clock.clone())
        .context(session.clone())
        .busy_flag(periodic_runtime::BusyFlag::new())
        .period(PERIOD);
    (clock, session, builder)
}

/// Advance one period and run whatever became due.
pub fn step(clock: &ManualClock, session: &SessionLoop<ManualClock>) -> usize {
    clock.advance(PERIOD);
    session.run_pending().expect("tick failed")
}
