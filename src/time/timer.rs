//! Timer set ordered by expiry.
//!
//! Timers live in a generational [`Slab`]; a `BTreeSet` of
//! `(expiry, key)` pairs keeps them ordered so the minimum is always the
//! next timer to fire. [`TimerHandle`]s hold a weak reference to the set
//! plus a slab key, so a handle outliving its manager is harmless.
//!
//! The manager never runs callbacks itself: [`TimerManager::list_expired`]
//! hands the expired callbacks to the caller, which in this crate is the
//! reactor's idle loop scheduling them as tasks.

use crate::time::clock::{Clock, SystemClock};
use crate::utils::slab::{Key, Slab};

use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A backward clock jump larger than this expires every timer.
const ROLLOVER_THRESHOLD_MS: u64 = 60 * 60 * 1000;

/// Callback type stored by the timer set.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

type FrontHook = Box<dyn Fn() + Send + Sync + 'static>;

struct TimerEntry {
    period_ms: u64,
    next_ms: u64,
    recurring: bool,
    callback: TimerCallback,
}

struct TimerState {
    entries: Slab<TimerEntry>,
    order: BTreeSet<(u64, Key)>,
    previous_ms: u64,
}

impl TimerState {
    fn is_first(&self, next_ms: u64, key: Key) -> bool {
        self.order.first() == Some(&(next_ms, key))
    }
}

pub(crate) struct TimerShared {
    state: RwLock<TimerState>,
    clock: Box<dyn Clock>,
    on_front: Option<FrontHook>,
    /// Set once the front hook has fired; cleared by `next_timer_delay`.
    tickled: AtomicBool,
}

impl TimerShared {
    /// Inserts `(next_ms, key)` into the order and fires the front hook if it
    /// became the earliest timer. The hook runs after the lock is released.
    fn insert_ordered(&self, mut state: parking_lot::RwLockWriteGuard<'_, TimerState>, next_ms: u64, key: Key) {
        state.order.insert((next_ms, key));
        let at_front = state.is_first(next_ms, key) && !self.tickled.swap(true, Ordering::SeqCst);
        drop(state);

        if at_front && let Some(hook) = &self.on_front {
            hook();
        }
    }
}

/// A set of one-shot and recurring timers.
///
/// Cloning is cheap and every clone refers to the same set.
///
/// # Example
/// ```ignore
/// use fiberio::TimerManager;
///
/// let timers = TimerManager::new();
/// let handle = timers.add_timer(100, || println!("tick"), true);
///
/// for cb in timers.list_expired() {
///     cb();
/// }
/// handle.cancel();
/// ```
#[derive(Clone)]
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    /// Creates an empty set driven by the system wall clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Creates an empty set driven by `clock`.
    pub fn with_clock<C: Clock>(clock: C) -> Self {
        Self::build(Box::new(clock), None)
    }

    /// Creates a set that calls `on_front` whenever a newly inserted timer
    /// becomes the earliest one.
    pub(crate) fn with_front_hook<C, F>(clock: C, on_front: F) -> Self
    where
        C: Clock,
        F: Fn() + Send + Sync + 'static,
    {
        Self::build(Box::new(clock), Some(Box::new(on_front)))
    }

    fn build(clock: Box<dyn Clock>, on_front: Option<FrontHook>) -> Self {
        let previous_ms = clock.now_ms();
        Self {
            shared: Arc::new(TimerShared {
                state: RwLock::new(TimerState {
                    entries: Slab::new(),
                    order: BTreeSet::new(),
                    previous_ms,
                }),
                clock,
                on_front,
                tickled: AtomicBool::new(false),
            }),
        }
    }

    /// Current time according to this manager's clock.
    pub fn now_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    /// Adds a timer that fires `ms` milliseconds from now.
    ///
    /// # Arguments
    /// * `ms` - delay in milliseconds, and the period if `recurring`
    /// * `callback` - invoked by whoever drains [`list_expired`](Self::list_expired)
    /// * `recurring` - re-arm after every expiry instead of firing once
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(ms, Arc::new(callback), recurring)
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only runs while
    /// `guard` can still be upgraded.
    pub fn add_condition_timer<F, T>(
        &self,
        ms: u64,
        callback: F,
        guard: Weak<T>,
        recurring: bool,
    ) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if guard.upgrade().is_some() {
                    callback();
                }
            },
            recurring,
        )
    }

    fn insert(&self, ms: u64, callback: TimerCallback, recurring: bool) -> TimerHandle {
        let next_ms = self.shared.clock.now_ms_ceil().saturating_add(ms);
        let mut state = self.shared.state.write();
        let key = state.entries.insert(TimerEntry {
            period_ms: ms,
            next_ms,
            recurring,
            callback,
        });
        self.shared.insert_ordered(state, next_ms, key);

        TimerHandle {
            manager: Arc::downgrade(&self.shared),
            key,
        }
    }

    /// Time until the earliest timer fires, `Some(ZERO)` if it is overdue and
    /// `None` when no timer is pending.
    ///
    /// Reading the delay re-arms the front-insertion hook.
    pub fn next_timer_delay(&self) -> Option<Duration> {
        self.shared.tickled.store(false, Ordering::SeqCst);

        let state = self.shared.state.read();
        let &(next_ms, _) = state.order.first()?;
        let now = self.now_ms();

        Some(Duration::from_millis(next_ms.saturating_sub(now)))
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.state.read().order.is_empty()
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.shared.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every timer whose expiry is at or before now and returns their
    /// callbacks in expiry order.
    ///
    /// Recurring timers are re-armed one period from now; one-shot timers are
    /// dropped. If the clock moved backwards by more than an hour since the
    /// previous call, every timer is treated as expired.
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        let now = self.now_ms();
        if !self.has_timer() {
            return Vec::new();
        }

        let rearm_from = self.shared.clock.now_ms_ceil();
        let mut state = self.shared.state.write();
        let rollover = detect_clock_rollover(&mut state.previous_ms, now);
        if rollover {
            log::warn!("clock moved back by more than an hour, expiring all timers");
        }

        let expired: Vec<(u64, Key)> = state
            .order
            .iter()
            .take_while(|(next_ms, _)| rollover || *next_ms <= now)
            .copied()
            .collect();

        let mut callbacks = Vec::with_capacity(expired.len());
        for item in expired {
            state.order.remove(&item);
            let (_, key) = item;

            let Some(entry) = state.entries.get_mut(key) else {
                continue;
            };
            callbacks.push(entry.callback.clone());

            if entry.recurring {
                entry.next_ms = rearm_from.saturating_add(entry.period_ms);
                let next_ms = entry.next_ms;
                state.order.insert((next_ms, key));
            } else {
                state.entries.remove(key);
            }
        }

        callbacks
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager").field("timers", &self.len()).finish()
    }
}

/// Records `now` and reports whether it lies more than an hour before the
/// previously observed time.
fn detect_clock_rollover(previous_ms: &mut u64, now: u64) -> bool {
    let rollover = now < previous_ms.saturating_sub(ROLLOVER_THRESHOLD_MS);
    *previous_ms = now;
    rollover
}

/// Handle to a pending timer.
///
/// Operations return `false` once the timer has fired (one-shot), been
/// cancelled, or its manager is gone.
#[derive(Clone)]
pub struct TimerHandle {
    manager: Weak<TimerShared>,
    key: Key,
}

impl TimerHandle {
    /// Removes the timer without running it.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };

        let mut state = shared.state.write();
        match state.entries.remove(self.key) {
            Some(entry) => {
                state.order.remove(&(entry.next_ms, self.key));
                true
            }
            None => false,
        }
    }

    /// Pushes the expiry to one full period from now.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };

        let now = shared.clock.now_ms_ceil();
        let mut state = shared.state.write();
        let Some(entry) = state.entries.get_mut(self.key) else {
            return false;
        };

        let old = entry.next_ms;
        entry.next_ms = now.saturating_add(entry.period_ms);
        let next_ms = entry.next_ms;

        state.order.remove(&(old, self.key));
        state.order.insert((next_ms, self.key));
        true
    }

    /// Changes the period to `ms`.
    ///
    /// With `from_now` the new period starts now. Otherwise it starts where
    /// the current period started, so a recurring timer keeps its phase.
    /// Resetting to the same period without `from_now` changes nothing.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };

        let now = shared.clock.now_ms_ceil();
        let mut state = shared.state.write();
        let Some(entry) = state.entries.get_mut(self.key) else {
            return false;
        };
        if entry.period_ms == ms && !from_now {
            return true;
        }

        let old = entry.next_ms;
        let start = if from_now {
            now
        } else {
            old.saturating_sub(entry.period_ms)
        };
        entry.period_ms = ms;
        entry.next_ms = start.saturating_add(ms);
        let next_ms = entry.next_ms;

        state.order.remove(&(old, self.key));
        shared.insert_ordered(state, next_ms, self.key);
        true
    }

    /// Absolute expiry in clock milliseconds, if the timer is still pending.
    pub fn deadline_ms(&self) -> Option<u64> {
        let shared = self.manager.upgrade()?;
        let state = shared.state.read();
        state.entries.get(self.key).map(|entry| entry.next_ms)
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("deadline_ms", &self.deadline_ms())
            .finish()
    }
}
