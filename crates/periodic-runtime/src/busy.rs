//! Process-wide busy indicator toggled around every tick.
//!
//! The flag is a plain last-writer-wins boolean. Tasks running concurrently
//! interleave their writes; a task finishing its tick clears the flag even if
//! another task is still inside its callback.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

static GLOBAL_BUSY: Lazy<BusyFlag> = Lazy::new(BusyFlag::new);

/// Shared writable busy flag.
#[derive(Debug, Clone, Default)]
pub struct BusyFlag {
    busy: Arc<AtomicBool>,
}

impl BusyFlag {
    /// Create an isolated flag, initially idle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide flag used when no flag is injected.
    #[must_use]
    pub fn global() -> Self {
        GLOBAL_BUSY.clone()
    }

    pub fn set(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Mark busy until the returned guard is dropped.
    #[must_use = "the flag is cleared as soon as the guard is dropped"]
    pub fn enter(&self) -> BusyGuard<'_> {
        self.set(true);
        BusyGuard { flag: self }
    }

    /// Whether two handles point at the same underlying flag.
    #[must_use]
    pub fn same_flag(&self, other: &BusyFlag) -> bool {
        Arc::ptr_eq(&self.busy, &other.busy)
    }
}

/// Clears the busy flag on drop, including during unwinding.
#[derive(Debug)]
pub struct BusyGuard<'a> {
    flag: &'a BusyFlag,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_clears_flag_on_drop() {
        let flag = BusyFlag::new();
        {
            let _guard = flag.enter();
            assert!(flag.is_busy());
        }
        assert!(!flag.is_busy());
    }

    #[test]
    fn guard_clears_flag_on_panic() {
        let flag = BusyFlag::new();
        let inner = flag.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = inner.enter();
            panic!("callback exploded");
        });
        assert!(result.is_err());
        assert!(!flag.is_busy());
    }

    #[test]
    fn global_flag_is_shared() {
        assert!(BusyFlag::global().same_flag(&BusyFlag::global()));
        assert!(!BusyFlag::new().same_flag(&BusyFlag::global()));
    }

    #[test]
    fn last_writer_wins() {
        let flag = BusyFlag::new();
        let a = flag.enter();
        let b = flag.enter();
        drop(a);
        // b is still "inside" but the flag was cleared by a.
        assert!(!flag.is_busy());
        drop(b);
        assert!(!flag.is_busy());
    }
}
