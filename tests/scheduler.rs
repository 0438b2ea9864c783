use fiberio::fiber::{self, Fiber, FiberState};
use fiberio::{Scheduler, Task};

use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

#[test]
fn test_three_callbacks_on_two_workers() {
    let scheduler = Scheduler::new(2, false, "three").unwrap();
    scheduler.start().unwrap();

    let counters: Arc<Vec<AtomicUsize>> = Arc::new((0..3).map(|_| AtomicUsize::new(0)).collect());
    for index in 0..3 {
        let counters = counters.clone();
        scheduler.schedule(
            Task::from_fn(move || {
                counters[index].fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );
    }

    scheduler.stop();

    for counter in counters.iter() {
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn test_scheduled_fiber_reaches_term() {
    let scheduler = Scheduler::new(1, false, "fiber").unwrap();
    scheduler.start().unwrap();

    let fiber = Fiber::new(|| {}, 0, false).unwrap();
    scheduler.schedule(fiber.clone(), None);
    scheduler.stop();

    assert_eq!(fiber.state(), FiberState::Term);
}

#[test]
fn test_ready_fiber_is_rescheduled() {
    let scheduler = Scheduler::new(2, false, "ready").unwrap();
    scheduler.start().unwrap();

    let rounds = Arc::new(AtomicUsize::new(0));
    let rounds2 = rounds.clone();
    scheduler.spawn(move || {
        for _ in 0..5 {
            rounds2.fetch_add(1, Ordering::SeqCst);
            fiber::yield_to_ready();
        }
    });

    scheduler.stop();
    assert_eq!(rounds.load(Ordering::SeqCst), 5);
}

#[test]
fn test_affinity_pins_tasks_to_one_worker() {
    let scheduler = Scheduler::new(3, false, "pinned").unwrap();
    scheduler.start().unwrap();

    let workers = scheduler.worker_ids();
    assert_eq!(workers.len(), 3);
    let target = workers[1];

    let seen = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..10 {
        let seen = seen.clone();
        scheduler.schedule(
            Task::from_fn(move || seen.lock().push(thread::current().id())),
            Some(target),
        );
    }

    scheduler.stop();

    let seen = seen.lock();
    assert_eq!(seen.len(), 10);
    assert!(seen.iter().all(|id| *id == target));
}

thread_local! {
    static EXECUTING: Cell<usize> = const { Cell::new(0) };
}

// Not inlined: a fiber may resume on another thread, so the thread-local
// must be looked up again on every call.
#[inline(never)]
fn enter_fiber() -> usize {
    EXECUTING.with(|executing| {
        executing.set(executing.get() + 1);
        executing.get()
    })
}

#[inline(never)]
fn leave_fiber() {
    EXECUTING.with(|executing| executing.set(executing.get() - 1));
}

#[test]
fn test_one_fiber_executes_per_thread() {
    let scheduler = Scheduler::new(4, false, "exclusive").unwrap();
    scheduler.start().unwrap();

    let most = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    for _ in 0..64 {
        let most = most.clone();
        let finished = finished.clone();
        scheduler.spawn(move || {
            for _ in 0..8 {
                most.fetch_max(enter_fiber(), Ordering::SeqCst);
                thread::yield_now();
                most.fetch_max(EXECUTING.with(Cell::get), Ordering::SeqCst);
                leave_fiber();
                fiber::yield_to_ready();
            }
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }

    scheduler.stop();
    assert_eq!(finished.load(Ordering::SeqCst), 64);
    assert_eq!(most.load(Ordering::SeqCst), 1);
}

#[test]
fn test_fibers_hopping_between_workers_run_exactly_once_per_step() {
    const WORKERS: usize = 8;
    const ROUNDS: usize = 200;

    let scheduler = Scheduler::new(WORKERS, false, "hop").unwrap();
    scheduler.start().unwrap();
    let workers = scheduler.worker_ids();

    let steps: Arc<Vec<AtomicUsize>> = Arc::new((0..WORKERS).map(|_| AtomicUsize::new(0)).collect());
    for index in 0..WORKERS {
        let steps = steps.clone();
        let workers = workers.clone();
        scheduler.spawn(move || {
            let current = Scheduler::current().unwrap();
            for round in 0..ROUNDS {
                current.switch_to(Some(workers[(index + round) % WORKERS]));
                steps[index].fetch_add(1, Ordering::SeqCst);
                fiber::yield_to_ready();
            }
        });
    }

    scheduler.stop();
    for step in steps.iter() {
        assert_eq!(step.load(Ordering::SeqCst), ROUNDS);
    }
}

#[test]
fn test_caller_mode_runs_tasks_on_stop() {
    let scheduler = Scheduler::new(1, true, "caller").unwrap();
    scheduler.start().unwrap();
    assert_eq!(scheduler.worker_ids(), vec![thread::current().id()]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..2 {
        let seen = seen.clone();
        scheduler.spawn(move || seen.lock().push(thread::current().id()));
    }
    assert!(seen.lock().is_empty());

    scheduler.stop();

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|id| *id == thread::current().id()));
}

#[test]
fn test_caller_mode_stop_without_work_releases_thread() {
    let scheduler = Scheduler::new(1, true, "caller_idle").unwrap();
    scheduler.start().unwrap();
    assert_eq!(Scheduler::current().unwrap().name(), "caller_idle");

    scheduler.stop();

    assert!(Scheduler::current().is_none());
    assert!(!fiber::in_fiber());

    // the thread can host another caller-mode scheduler afterwards
    let next = Scheduler::new(1, true, "caller_next").unwrap();
    next.start().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = ran.clone();
    next.spawn(move || {
        ran2.fetch_add(1, Ordering::SeqCst);
    });
    next.stop();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(Scheduler::current().is_none());
}

#[test]
fn test_caller_mode_with_extra_workers() {
    let scheduler = Scheduler::new(3, true, "mixed").unwrap();
    scheduler.start().unwrap();
    assert_eq!(scheduler.worker_ids().len(), 3);

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..20 {
        let count = count.clone();
        scheduler.spawn(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }

    scheduler.stop();
    assert_eq!(count.load(Ordering::SeqCst), 20);
}

#[test]
fn test_switch_to_moves_fiber() {
    let scheduler = Scheduler::new(2, false, "switch").unwrap();
    scheduler.start().unwrap();
    let target = scheduler.worker_ids()[0];

    let landed = Arc::new(Mutex::new(None));
    let landed2 = landed.clone();
    scheduler.spawn(move || {
        let current = Scheduler::current().unwrap();
        current.switch_to(Some(target));
        *landed2.lock() = Some(thread::current().id());
    });

    scheduler.stop();
    assert_eq!(*landed.lock(), Some(target));
}

#[test]
fn test_current_scheduler_inside_tasks() {
    let scheduler = Scheduler::new(1, false, "named").unwrap();
    scheduler.start().unwrap();
    assert!(Scheduler::current().is_none());

    let name = Arc::new(Mutex::new(String::new()));
    let name2 = name.clone();
    scheduler.spawn(move || {
        *name2.lock() = Scheduler::current().unwrap().name().to_string();
    });

    scheduler.stop();
    assert_eq!(*name.lock(), "named");
}

#[test]
fn test_schedule_batch_runs_everything() {
    let scheduler = Scheduler::new(2, false, "batch").unwrap();
    scheduler.start().unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Task> = (0..16)
        .map(|_| {
            let count = count.clone();
            Task::from_fn(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    scheduler.schedule_batch(tasks);

    scheduler.stop();
    assert_eq!(count.load(Ordering::SeqCst), 16);
}

#[test]
fn test_panicking_callback_does_not_kill_worker() {
    let scheduler = Scheduler::new(1, false, "panics").unwrap();
    scheduler.start().unwrap();

    let after = Arc::new(AtomicUsize::new(0));
    let after2 = after.clone();
    scheduler.spawn(|| panic!("task failure"));
    scheduler.spawn(move || {
        after2.fetch_add(1, Ordering::SeqCst);
    });

    scheduler.stop();
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[test]
fn test_drop_stops_scheduler() {
    let count = Arc::new(AtomicUsize::new(0));
    {
        let scheduler = Scheduler::new(2, false, "dropped").unwrap();
        scheduler.start().unwrap();
        for _ in 0..8 {
            let count = count.clone();
            scheduler.spawn(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
    }
    assert_eq!(count.load(Ordering::SeqCst), 8);
}
