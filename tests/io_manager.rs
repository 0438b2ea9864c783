use fiberio::{Config, Error, Event, IoManager, config, fiber};

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn setup() {
    config::update(|c| c.max_poll_timeout_ms = 50);
}

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(ret, 0);
    (fds[0], fds[1])
}

fn close(fds: &[RawFd]) {
    for &fd in fds {
        unsafe { libc::close(fd) };
    }
}

fn flag_callback(flag: &Arc<AtomicUsize>) -> Option<fiberio::EventCallback> {
    let flag = flag.clone();
    Some(Box::new(move || {
        flag.fetch_add(1, Ordering::SeqCst);
    }))
}

#[test]
fn test_readiness_resumes_parked_fiber() {
    setup();
    let iom = IoManager::new(2, false, "ready").unwrap();
    let (r, w) = pipe();

    let got = Arc::new(AtomicUsize::new(0));
    let got2 = got.clone();
    iom.spawn(move || {
        let iom = IoManager::current().unwrap();
        iom.add_event(r, Event::Read, None).unwrap();
        fiber::yield_to_hold();

        let mut byte = 0u8;
        let n = unsafe { libc::read(r, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        assert_eq!(n, 1);
        got2.store(byte as usize, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(30));
    assert_eq!(unsafe { libc::write(w, b"*".as_ptr() as *const libc::c_void, 1) }, 1);

    iom.stop();
    assert_eq!(got.load(Ordering::SeqCst), b'*' as usize);
    assert_eq!(iom.pending_event_count(), 0);
    close(&[r, w]);
}

#[test]
fn test_callback_registered_from_outside() {
    setup();
    let iom = IoManager::new(1, false, "outside").unwrap();
    let (r, w) = pipe();

    let fired = Arc::new(AtomicUsize::new(0));
    iom.add_event(r, Event::Read, flag_callback(&fired)).unwrap();
    assert_eq!(iom.pending_event_count(), 1);

    assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) }, 1);
    iom.stop();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(iom.pending_event_count(), 0);
    close(&[r, w]);
}

#[test]
fn test_cancel_event_fires_once() {
    setup();
    let iom = IoManager::new(1, false, "cancel").unwrap();
    let (r, w) = pipe();

    let fired = Arc::new(AtomicUsize::new(0));
    iom.add_event(r, Event::Read, flag_callback(&fired)).unwrap();

    assert!(iom.cancel_event(r, Event::Read));
    assert!(!iom.cancel_event(r, Event::Read));
    assert_eq!(iom.pending_event_count(), 0);

    iom.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    close(&[r, w]);
}

#[test]
fn test_del_event_does_not_fire() {
    setup();
    let iom = IoManager::new(1, false, "del").unwrap();
    let (r, w) = pipe();

    let fired = Arc::new(AtomicUsize::new(0));
    iom.add_event(r, Event::Read, flag_callback(&fired)).unwrap();
    assert!(iom.del_event(r, Event::Read));
    assert!(!iom.del_event(r, Event::Read));
    assert_eq!(iom.pending_event_count(), 0);

    assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) }, 1);
    iom.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    close(&[r, w]);
}

#[test]
fn test_cancel_all_wakes_both_directions() {
    setup();
    let iom = IoManager::new(1, false, "cancel_all").unwrap();
    let (a, b) = socketpair();

    // Fill the send buffer so neither direction of `a` is ready.
    let flags = unsafe { libc::fcntl(a, libc::F_GETFL) };
    unsafe { libc::fcntl(a, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    let chunk = [0u8; 4096];
    while unsafe { libc::write(a, chunk.as_ptr() as *const libc::c_void, chunk.len()) } > 0 {}

    let fired = Arc::new(AtomicUsize::new(0));
    iom.add_event(a, Event::Read, flag_callback(&fired)).unwrap();
    iom.add_event(a, Event::Write, flag_callback(&fired)).unwrap();
    assert_eq!(iom.pending_event_count(), 2);

    assert!(iom.cancel_all(a));
    assert!(!iom.cancel_all(a));
    assert_eq!(iom.pending_event_count(), 0);

    iom.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    close(&[a, b]);
}

#[test]
fn test_peer_hangup_wakes_reader_and_writer() {
    setup();
    let iom = IoManager::new(2, false, "hangup").unwrap();
    let (a, b) = socketpair();

    // Fill the send buffer so neither direction of `a` is ready.
    let flags = unsafe { libc::fcntl(a, libc::F_GETFL) };
    unsafe { libc::fcntl(a, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    let chunk = [0u8; 4096];
    while unsafe { libc::write(a, chunk.as_ptr() as *const libc::c_void, chunk.len()) } > 0 {}

    let woken: Arc<Vec<AtomicUsize>> = Arc::new((0..2).map(|_| AtomicUsize::new(0)).collect());
    for (index, event) in [Event::Read, Event::Write].into_iter().enumerate() {
        let woken = woken.clone();
        iom.spawn(move || {
            let iom = IoManager::current().unwrap();
            iom.add_event(a, event, None).unwrap();
            fiber::yield_to_hold();
            woken[index].fetch_add(1, Ordering::SeqCst);
        });
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while iom.pending_event_count() < 2 {
        assert!(Instant::now() < deadline, "waiters never registered");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(woken[0].load(Ordering::SeqCst) + woken[1].load(Ordering::SeqCst), 0);

    close(&[b]);
    iom.stop();

    assert_eq!(woken[0].load(Ordering::SeqCst), 1);
    assert_eq!(woken[1].load(Ordering::SeqCst), 1);
    assert_eq!(iom.pending_event_count(), 0);
    close(&[a]);
}

#[test]
fn test_unknown_registrations_are_rejected() {
    setup();
    let iom = IoManager::new(1, false, "invalid").unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let result = iom.add_event(-1, Event::Read, flag_callback(&fired));
    assert!(matches!(result, Err(Error::InvalidFd(-1))));

    assert!(!iom.del_event(5000, Event::Read));
    assert!(!iom.cancel_event(-3, Event::Write));
    assert!(!iom.cancel_all(5000));

    iom.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_timer_callback_runs_as_task() {
    setup();
    let iom = IoManager::new(2, false, "timers").unwrap();

    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = fired.clone();
    let start = Instant::now();
    iom.add_timer(
        80,
        move || {
            assert!(fiber::in_fiber());
            assert!(IoManager::current().is_some());
            fired2.store(true, Ordering::SeqCst);
        },
        false,
    );
    assert!(iom.has_timer());

    // stop waits for pending timers
    iom.stop();
    assert!(fired.load(Ordering::SeqCst));
    assert!(start.elapsed() >= Duration::from_millis(80));
    assert!(!iom.has_timer());
}

#[test]
fn test_recurring_timer_cancelled_from_callback() {
    setup();
    let iom = IoManager::new(1, false, "recurring").unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let handle = Arc::new(parking_lot::Mutex::new(None::<fiberio::TimerHandle>));

    let hits2 = hits.clone();
    let handle2 = handle.clone();
    let timer = iom.add_timer(
        20,
        move || {
            if hits2.fetch_add(1, Ordering::SeqCst) + 1 == 3
                && let Some(handle) = handle2.lock().as_ref()
            {
                handle.cancel();
            }
        },
        true,
    );
    *handle.lock() = Some(timer);

    iom.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn test_caller_mode_io_manager() {
    setup();
    let iom = IoManager::new(1, true, "io_caller").unwrap();
    let (r, w) = pipe();

    let ran_on = Arc::new(parking_lot::Mutex::new(None));
    let ran_on2 = ran_on.clone();
    iom.spawn(move || {
        let iom = IoManager::current().unwrap();
        iom.add_event(r, Event::Read, None).unwrap();
        fiber::yield_to_hold();
        *ran_on2.lock() = Some(thread::current().id());
    });
    assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) }, 1);

    iom.stop();
    assert_eq!(*ran_on.lock(), Some(thread::current().id()));
    close(&[r, w]);
}

#[test]
fn test_many_fibers_wait_on_many_pipes() {
    setup();
    let iom = IoManager::new(3, false, "fanout").unwrap();
    let pipes: Vec<(RawFd, RawFd)> = (0..16).map(|_| pipe()).collect();

    let done = Arc::new(AtomicUsize::new(0));
    for &(r, _) in &pipes {
        let done = done.clone();
        iom.spawn(move || {
            let iom = IoManager::current().unwrap();
            iom.add_event(r, Event::Read, None).unwrap();
            fiber::yield_to_hold();
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    thread::sleep(Duration::from_millis(20));
    for &(_, w) in &pipes {
        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) }, 1);
    }

    iom.stop();
    assert_eq!(done.load(Ordering::SeqCst), 16);
    for (r, w) in pipes {
        close(&[r, w]);
    }
}

#[test]
fn test_stop_with_nothing_to_do_is_quick() {
    setup();
    let iom = IoManager::new(4, false, "quick").unwrap();
    let start = Instant::now();
    iom.stop();
    iom.stop();
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_task_from_outside_wakes_idle_worker() {
    // long poll cap: a missed wake-up would show as a multi-second stall
    let config = Config {
        max_poll_timeout_ms: 3000,
        ..Config::default()
    };
    let iom = IoManager::with_config(2, false, "wake", config).unwrap();

    for _ in 0..20 {
        thread::sleep(Duration::from_millis(5));
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let start = Instant::now();
        iom.spawn(move || ran2.store(true, Ordering::SeqCst));

        while !ran.load(Ordering::SeqCst) {
            assert!(start.elapsed() < Duration::from_secs(1), "task stalled");
            thread::yield_now();
        }
    }

    let start = Instant::now();
    iom.stop();
    assert!(start.elapsed() < Duration::from_secs(2));
}
