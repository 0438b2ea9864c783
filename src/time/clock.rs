//! Millisecond clocks used by the timer manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "now" for a [`TimerManager`](crate::TimerManager).
///
/// Wall-clock time is used on purpose: a backward jump of the system clock
/// is observable and triggers rollover handling.
pub trait Clock: Send + Sync + 'static {
    /// Current time in milliseconds, truncated.
    fn now_ms(&self) -> u64;

    /// Current time rounded up to the next whole millisecond.
    ///
    /// Deadlines are computed from this value: a timer armed at `t` for
    /// `ms` milliseconds expires no earlier than `t + ms`.
    fn now_ms_ceil(&self) -> u64 {
        self.now_ms()
    }
}

/// The system wall clock, in milliseconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }

    fn now_ms_ceil(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos().div_ceil(1_000_000) as u64)
    }
}

/// A clock that only moves when told to. Useful for deterministic tests.
///
/// # Example
/// ```ignore
/// let clock = Arc::new(ManualClock::new(1_000));
/// let timers = TimerManager::with_clock(clock.clone());
/// clock.advance(50);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    /// Jumps to `ms`, which may lie in the past.
    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl<C: Clock> Clock for std::sync::Arc<C> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn now_ms_ceil(&self) -> u64 {
        (**self).now_ms_ceil()
    }
}
