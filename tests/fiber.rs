use fiberio::fiber::{self, Fiber, FiberState};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[test]
fn test_fiber_runs_until_yield() {
    let steps = Arc::new(AtomicUsize::new(0));
    let steps2 = steps.clone();

    let fiber = Fiber::new(
        move || {
            steps2.fetch_add(1, Ordering::SeqCst);
            fiber::yield_to_hold();
            steps2.fetch_add(1, Ordering::SeqCst);
        },
        0,
        false,
    )
    .unwrap();

    assert_eq!(fiber.state(), FiberState::Init);

    fiber.swap_in();
    assert_eq!(steps.load(Ordering::SeqCst), 1);
    assert_eq!(fiber.state(), FiberState::Hold);

    fiber.swap_in();
    assert_eq!(steps.load(Ordering::SeqCst), 2);
    assert_eq!(fiber.state(), FiberState::Term);
}

#[test]
fn test_yield_to_ready_sets_ready() {
    let fiber = Fiber::new(fiber::yield_to_ready, 64 * 1024, false).unwrap();

    fiber.swap_in();
    assert_eq!(fiber.state(), FiberState::Ready);

    fiber.swap_in();
    assert_eq!(fiber.state(), FiberState::Term);
}

#[test]
fn test_panic_marks_fiber_except() {
    let fiber = Fiber::new(|| panic!("boom"), 0, false).unwrap();

    fiber.swap_in();
    assert_eq!(fiber.state(), FiberState::Except);
}

#[test]
fn test_reset_reuses_finished_fiber() {
    let runs = Arc::new(AtomicUsize::new(0));

    let first = runs.clone();
    let fiber = Fiber::new(
        move || {
            first.fetch_add(1, Ordering::SeqCst);
        },
        0,
        false,
    )
    .unwrap();
    fiber.swap_in();
    assert_eq!(fiber.state(), FiberState::Term);

    let second = runs.clone();
    fiber
        .reset(move || {
            second.fetch_add(10, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(fiber.state(), FiberState::Init);

    fiber.swap_in();
    assert_eq!(fiber.state(), FiberState::Term);
    assert_eq!(runs.load(Ordering::SeqCst), 11);
}

#[test]
fn test_reset_after_panic() {
    let fiber = Fiber::new(|| panic!("first entry fails"), 0, false).unwrap();
    fiber.swap_in();
    assert_eq!(fiber.state(), FiberState::Except);

    fiber.reset(|| {}).unwrap();
    fiber.swap_in();
    assert_eq!(fiber.state(), FiberState::Term);
}

#[test]
#[should_panic(expected = "cannot be reset")]
fn test_reset_of_parked_fiber_panics() {
    let fiber = Fiber::new(fiber::yield_to_hold, 0, false).unwrap();
    fiber.swap_in();
    assert_eq!(fiber.state(), FiberState::Hold);

    fiber.reset(|| {}).unwrap();
}

#[test]
fn test_current_id_inside_and_outside() {
    let seen = Arc::new(AtomicU64::new(u64::MAX));
    let seen2 = seen.clone();

    let fiber = Fiber::new(
        move || {
            seen2.store(fiber::current_id(), Ordering::SeqCst);
            assert!(fiber::in_fiber());
            assert_eq!(Fiber::current().state(), FiberState::Exec);
        },
        0,
        false,
    )
    .unwrap();

    fiber.swap_in();
    assert_eq!(seen.load(Ordering::SeqCst), fiber.id());
    assert_ne!(fiber.id(), 0);
    assert_eq!(fiber::current_id(), 0);
    assert!(!fiber::in_fiber());
}

#[test]
fn test_ids_are_unique_and_total_counts_live_fibers() {
    let a = Fiber::new(|| {}, 0, false).unwrap();
    let b = Fiber::new(|| {}, 0, false).unwrap();

    assert_ne!(a.id(), b.id());
    assert!(Fiber::total() >= 2);
}

#[test]
fn test_main_fiber_is_exec() {
    let main = Fiber::current();
    assert!(main.is_main());
    assert_eq!(main.id(), 0);
    assert_eq!(main.state(), FiberState::Exec);
}

#[test]
fn test_fiber_interleaves_with_caller() {
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let outer_order = order.clone();
    let outer = Fiber::new(
        move || {
            outer_order.lock().push("outer start");
            fiber::yield_to_hold();
            outer_order.lock().push("outer end");
        },
        0,
        false,
    )
    .unwrap();

    outer.swap_in();
    order.lock().push("main");
    outer.swap_in();

    assert_eq!(*order.lock(), vec!["outer start", "main", "outer end"]);
}

#[test]
fn test_swap_in_reports_switch_out_state() {
    let fiber = Fiber::new(
        || {
            fiber::yield_to_ready();
            fiber::yield_to_hold();
        },
        0,
        false,
    )
    .unwrap();

    assert_eq!(fiber.swap_in(), FiberState::Ready);
    assert_eq!(fiber.swap_in(), FiberState::Hold);
    assert_eq!(fiber.swap_in(), FiberState::Term);
}
