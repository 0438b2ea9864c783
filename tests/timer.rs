use fiberio::time::{ManualClock, TimerManager};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn manual(start_ms: u64) -> (Arc<ManualClock>, TimerManager) {
    let clock = Arc::new(ManualClock::new(start_ms));
    let timers = TimerManager::with_clock(clock.clone());
    (clock, timers)
}

fn fire_all(timers: &TimerManager) -> usize {
    let callbacks = timers.list_expired();
    let count = callbacks.len();
    for callback in callbacks {
        callback();
    }
    count
}

#[test]
fn test_recurring_timer_fires_every_period() {
    let (clock, timers) = manual(0);
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    timers.add_timer(
        50,
        move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    for _ in 0..22 {
        clock.advance(10);
        fire_all(&timers);
    }

    assert_eq!(hits.load(Ordering::SeqCst), 4);
    assert_eq!(timers.len(), 1);
}

#[test]
fn test_one_shot_timer_fires_once() {
    let (clock, timers) = manual(0);
    let handle = timers.add_timer(20, || {}, false);

    clock.advance(19);
    assert_eq!(fire_all(&timers), 0);

    clock.advance(1);
    assert_eq!(fire_all(&timers), 1);
    assert!(timers.is_empty());
    assert!(!handle.cancel());
    assert_eq!(handle.deadline_ms(), None);
}

#[test]
fn test_list_expired_never_returns_future_timers() {
    let (clock, timers) = manual(1_000);
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    for delay in [30, 10, 20, 500] {
        let order = order.clone();
        timers.add_timer(delay, move || order.lock().push(delay), false);
    }

    clock.advance(30);
    assert_eq!(fire_all(&timers), 3);
    assert_eq!(*order.lock(), vec![10, 20, 30]);
    assert_eq!(timers.len(), 1);
    assert_eq!(timers.next_timer_delay(), Some(Duration::from_millis(470)));
}

#[test]
fn test_reset_keeps_phase_unless_from_now() {
    let (clock, timers) = manual(1_000);
    let handle = timers.add_timer(100, || {}, true);
    assert_eq!(handle.deadline_ms(), Some(1_100));

    clock.advance(100);
    assert_eq!(fire_all(&timers), 1);
    assert_eq!(handle.deadline_ms(), Some(1_200));

    clock.advance(30);
    assert!(handle.reset(50, false));
    assert_eq!(handle.deadline_ms(), Some(1_150));

    assert!(handle.reset(50, true));
    assert_eq!(handle.deadline_ms(), Some(1_180));
}

#[test]
fn test_reset_to_same_period_is_noop() {
    let (clock, timers) = manual(0);
    let handle = timers.add_timer(100, || {}, false);

    clock.advance(40);
    assert!(handle.reset(100, false));
    assert_eq!(handle.deadline_ms(), Some(100));
}

#[test]
fn test_refresh_pushes_deadline() {
    let (clock, timers) = manual(0);
    let handle = timers.add_timer(100, || {}, false);

    clock.advance(80);
    assert!(handle.refresh());
    assert_eq!(handle.deadline_ms(), Some(180));

    clock.advance(50);
    assert_eq!(fire_all(&timers), 0);
    clock.advance(50);
    assert_eq!(fire_all(&timers), 1);
    assert!(!handle.refresh());
}

#[test]
fn test_cancel_removes_timer() {
    let (clock, timers) = manual(0);
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    let handle = timers.add_timer(
        10,
        move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    assert!(handle.cancel());
    assert!(!handle.cancel());
    assert!(!timers.has_timer());

    clock.advance(100);
    assert_eq!(fire_all(&timers), 0);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_clock_rollback_expires_everything() {
    let hour = 60 * 60 * 1000;
    let (clock, timers) = manual(10 * hour);

    for delay in [1_000, 2_000, 3_000, 60_000, hour] {
        timers.add_timer(delay, || {}, false);
    }

    clock.set(8 * hour);
    assert_eq!(fire_all(&timers), 5);
    assert!(timers.is_empty());
}

#[test]
fn test_small_clock_rollback_expires_nothing() {
    let (clock, timers) = manual(10_000);
    timers.add_timer(1_000, || {}, false);

    clock.set(5_000);
    assert_eq!(fire_all(&timers), 0);
    assert_eq!(timers.len(), 1);
}

#[test]
fn test_condition_timer_skips_dropped_guard() {
    let (clock, timers) = manual(0);
    let hits = Arc::new(AtomicUsize::new(0));

    let alive = Arc::new(());
    let hits2 = hits.clone();
    timers.add_condition_timer(
        10,
        move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        },
        Arc::downgrade(&alive),
        false,
    );

    let gone = Arc::new(());
    let hits3 = hits.clone();
    timers.add_condition_timer(
        10,
        move || {
            hits3.fetch_add(100, Ordering::SeqCst);
        },
        Arc::downgrade(&gone),
        false,
    );
    drop(gone);

    clock.advance(10);
    assert_eq!(fire_all(&timers), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_next_timer_delay() {
    let (clock, timers) = manual(500);
    assert_eq!(timers.next_timer_delay(), None);

    timers.add_timer(200, || {}, false);
    timers.add_timer(50, || {}, false);
    assert_eq!(timers.next_timer_delay(), Some(Duration::from_millis(50)));

    clock.advance(80);
    assert_eq!(timers.next_timer_delay(), Some(Duration::ZERO));
}

#[test]
fn test_handle_outlives_manager() {
    let (_clock, timers) = manual(0);
    let handle = timers.add_timer(10, || {}, false);
    drop(timers);

    assert!(!handle.cancel());
    assert!(!handle.refresh());
    assert!(!handle.reset(20, true));
    assert_eq!(handle.deadline_ms(), None);
}

#[test]
fn test_system_clock_timer_never_fires_early() {
    let timers = TimerManager::new();

    for _ in 0..50 {
        let start = Instant::now();
        timers.add_timer(5, || {}, false);
        while timers.list_expired().is_empty() {
            std::hint::spin_loop();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(5), "fired after {elapsed:?}");
    }
}
