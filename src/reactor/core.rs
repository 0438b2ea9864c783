//! The I/O manager: a scheduler whose idle fibers run an epoll loop.
//!
//! [`IoManager`] combines three things:
//!
//! - a [`Scheduler`] core running fibers on a thread pool,
//! - a [`TimerManager`] whose expired callbacks are scheduled as tasks,
//! - an edge-triggered epoll instance plus a wake pipe.
//!
//! A fiber waiting for I/O registers interest with [`IoManager::add_event`]
//! and yields. When epoll reports readiness, the idle loop re-arms the fd for
//! any remaining interest and reschedules the waiter.
//!
//! # Example
//!
//! ```ignore
//! use fiberio::{Event, IoManager, fiber};
//!
//! let iom = IoManager::new(2, false, "io")?;
//! iom.spawn(move || {
//!     let iom = IoManager::current().unwrap();
//!     iom.add_event(fd, Event::Read, None).unwrap();
//!     fiber::yield_to_hold();
//!     // fd is readable now
//! });
//! iom.stop();
//! ```

use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::fiber;
use crate::reactor::event::{Event, Poller, set_nonblocking};
use crate::reactor::fd_context::{EventCallback, FdContext, Waiter};
use crate::runtime::context;
use crate::runtime::scheduler::{Core, Handle, Scheduler, WeakHandle};
use crate::runtime::task::Task;
use crate::time::{SystemClock, TimerHandle, TimerManager};

use parking_lot::RwLock;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::Duration;

const EPOLLET: u32 = libc::EPOLLET as u32;
const EPOLLERR: u32 = libc::EPOLLERR as u32;
const EPOLLHUP: u32 = libc::EPOLLHUP as u32;

const INITIAL_CONTEXTS: usize = 32;

/// Self-pipe used to interrupt `epoll_wait` from other threads.
struct WakePipe {
    read: RawFd,
    write: RawFd,
}

impl WakePipe {
    fn new() -> Result<Self> {
        let mut fds = [0; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(Error::Pipe(io::Error::last_os_error()));
        }

        let pipe = Self {
            read: fds[0],
            write: fds[1],
        };
        set_nonblocking(pipe.read).map_err(Error::Pipe)?;
        set_nonblocking(pipe.write).map_err(Error::Pipe)?;

        Ok(pipe)
    }

    fn notify(&self) {
        let ret = unsafe { libc::write(self.write, b"T".as_ptr() as *const libc::c_void, 1) };
        if ret != 1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                log::error!("failed to write to wake pipe: {err}");
            }
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 256];
        while unsafe { libc::read(self.read, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) } > 0 {}
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read);
            libc::close(self.write);
        }
    }
}

/// Shared state behind an [`IoManager`].
pub(crate) struct IoInner {
    core: Core,
    timers: TimerManager,
    poller: Poller,
    wake: WakePipe,
    pending: AtomicUsize,
    contexts: RwLock<Vec<Arc<FdContext>>>,
    max_poll_timeout_ms: u64,
    max_events: usize,
}

impl IoInner {
    fn new(workers: usize, use_caller: bool, name: &str, config: Config) -> Result<Arc<Self>> {
        let poller = Poller::new()?;
        let wake = WakePipe::new()?;
        poller.add(wake.read, Event::READ | EPOLLET)?;

        let core = Core::new(workers, use_caller, name, config);

        Ok(Arc::new_cyclic(|weak: &Weak<IoInner>| {
            let weak = weak.clone();
            let timers = TimerManager::with_front_hook(SystemClock, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.tickle();
                }
            });

            IoInner {
                core,
                timers,
                poller,
                wake,
                pending: AtomicUsize::new(0),
                contexts: RwLock::new((0..INITIAL_CONTEXTS as RawFd).map(|fd| Arc::new(FdContext::new(fd))).collect()),
                max_poll_timeout_ms: config.max_poll_timeout_ms,
                max_events: config.max_events.max(1),
            }
        }))
    }

    pub(crate) fn core(&self) -> &Core {
        &self.core
    }

    /// Context for `fd`, growing the table when `fd` is beyond its end.
    fn context(&self, fd: RawFd) -> Arc<FdContext> {
        let index = fd as usize;
        if let Some(ctx) = self.contexts.read().get(index) {
            return ctx.clone();
        }

        let mut contexts = self.contexts.write();
        let len = contexts.len();
        if index >= len {
            let target = (index * 3 / 2).max(index + 1);
            contexts.extend((len..target).map(|fd| Arc::new(FdContext::new(fd as RawFd))));
        }
        contexts[index].clone()
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.contexts.read().get(fd as usize).cloned()
    }

    fn rearm(&self, fd: RawFd, remaining: u32) -> Result<()> {
        if remaining == Event::NONE {
            self.poller.delete(fd)
        } else {
            self.poller.modify(fd, EPOLLET | remaining)
        }
    }

    fn add_event(self: &Arc<Self>, fd: RawFd, event: Event, callback: Option<EventCallback>) -> Result<()> {
        if fd < 0 {
            return Err(Error::InvalidFd(fd));
        }

        let waiter = match callback {
            Some(callback) => Waiter::Callback(callback),
            None => {
                assert!(fiber::in_fiber(), "add_event without a callback must be called from a fiber");
                Waiter::Fiber(fiber::Fiber::current())
            }
        };
        let scheduler = context::current()
            .map(|handle| handle.downgrade())
            .unwrap_or_else(|| WeakHandle::Io(Arc::downgrade(self)));

        let ctx = self.context(fd);
        let mut state = ctx.state.lock();

        if !state.has(event) {
            let result = if state.events == Event::NONE {
                self.poller.add(fd, EPOLLET | event.mask())
            } else {
                self.poller.modify(fd, EPOLLET | state.events | event.mask())
            };
            if let Err(e) = result {
                log::error!("{}: add_event({fd}, {event:?}): {e}", self.core.name());
                return Err(e);
            }

            self.pending.fetch_add(1, Ordering::SeqCst);
            state.events |= event.mask();
        } else {
            log::warn!("{}: replacing the {event:?} waiter on fd {fd}", self.core.name());
        }

        let slot = state.context_mut(event);
        slot.scheduler = Some(scheduler);
        slot.waiter = Some(waiter);
        log::trace!("{}: fd {} armed for {event:?}", self.core.name(), ctx.fd);

        Ok(())
    }

    fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut state = ctx.state.lock();
        if !state.has(event) {
            return false;
        }

        if let Err(e) = self.rearm(fd, state.events & !event.mask()) {
            log::error!("{}: del_event({fd}, {event:?}): {e}", self.core.name());
            return false;
        }

        state.clear(event);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut state = ctx.state.lock();
        if !state.has(event) {
            return false;
        }

        if let Err(e) = self.rearm(fd, state.events & !event.mask()) {
            log::error!("{}: cancel_event({fd}, {event:?}): {e}", self.core.name());
            return false;
        }

        state.trigger(event);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut state = ctx.state.lock();
        if state.events == Event::NONE {
            return false;
        }

        if let Err(e) = self.poller.delete(fd) {
            log::error!("{}: cancel_all({fd}): {e}", self.core.name());
            return false;
        }

        for event in [Event::Read, Event::Write] {
            if state.has(event) {
                state.trigger(event);
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
        debug_assert_eq!(state.events, Event::NONE);
        true
    }

    pub(crate) fn tickle(&self) {
        if !self.core.has_idle_threads() {
            return;
        }
        self.wake.notify();
    }

    pub(crate) fn stopping(&self) -> bool {
        !self.timers.has_timer() && self.pending.load(Ordering::SeqCst) == 0 && self.core.stopping()
    }

    /// The reactor loop run by every worker's idle fiber.
    pub(crate) fn idle(self: &Arc<Self>) {
        let handle = Handle::Io(self.clone());
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];

        loop {
            if self.stopping() {
                log::debug!("{}: reactor idle loop exiting", self.core.name());
                // Pass the wake-up on to workers still blocked in epoll_wait.
                self.tickle();
                break;
            }

            let timeout = self
                .timers
                .next_timer_delay()
                .map_or(self.max_poll_timeout_ms, |delay| {
                    (delay.as_millis() as u64).min(self.max_poll_timeout_ms)
                });

            let ready = match self.poller.wait(&mut events, timeout.min(i32::MAX as u64) as i32) {
                Ok(n) => n,
                Err(e) => {
                    log::error!("{}: epoll_wait failed: {e}", self.core.name());
                    0
                }
            };

            let expired = self.timers.list_expired();
            if !expired.is_empty() {
                log::trace!("{}: {} timer(s) expired", self.core.name(), expired.len());
                handle.schedule_batch(
                    expired
                        .into_iter()
                        .map(|callback| Task::from_fn(move || callback())),
                );
            }

            for event in &events[..ready] {
                let fd = event.u64 as RawFd;
                let mut fired = event.events;

                if fd == self.wake.read {
                    self.wake.drain();
                    continue;
                }

                let Some(ctx) = self.lookup(fd) else {
                    continue;
                };
                let mut state = ctx.state.lock();

                if fired & (EPOLLERR | EPOLLHUP) != 0 {
                    fired |= (Event::READ | Event::WRITE) & state.events;
                }
                let ready_mask = fired & (Event::READ | Event::WRITE) & state.events;
                if ready_mask == Event::NONE {
                    continue;
                }

                if let Err(e) = self.rearm(fd, state.events & !ready_mask) {
                    log::error!("{}: re-arming fd {fd}: {e}", self.core.name());
                    continue;
                }

                for direction in [Event::Read, Event::Write] {
                    if ready_mask & direction.mask() != 0 {
                        state.trigger(direction);
                        self.pending.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }

            fiber::yield_to_hold();
        }
    }
}

impl Drop for IoInner {
    fn drop(&mut self) {
        log::debug!("{}: io manager released", self.core.name());
    }
}

/// A scheduler with an epoll reactor and a timer set.
///
/// The value returned by [`IoManager::new`] owns the runtime: dropping it
/// stops the workers, exactly like [`Scheduler`].
pub struct IoManager {
    inner: Arc<IoInner>,
    owner: bool,
}

impl IoManager {
    /// Creates and starts an I/O manager.
    ///
    /// # Arguments
    /// * `workers` - total worker threads, the caller included in caller mode
    /// * `use_caller` - make the calling thread one of the workers
    /// * `name` - used for thread names and log lines
    ///
    /// # Errors
    /// Fails if epoll, the wake pipe, the root fiber or a worker thread
    /// cannot be created.
    pub fn new(workers: usize, use_caller: bool, name: &str) -> Result<Self> {
        Self::with_config(workers, use_caller, name, config::get())
    }

    /// Like [`new`](Self::new), with tunables private to this manager
    /// instead of the process-wide [`config`](crate::config).
    ///
    /// The hooked `connect` running on this manager's workers uses
    /// `config.connect_timeout_ms`.
    pub fn with_config(workers: usize, use_caller: bool, name: &str, config: Config) -> Result<Self> {
        let inner = IoInner::new(workers, use_caller, name, config)?;
        let handle = Handle::Io(inner.clone());
        handle.install_caller()?;
        handle.start()?;

        Ok(Self { inner, owner: true })
    }

    /// The I/O manager the calling thread works for, if any.
    pub fn current() -> Option<IoManager> {
        match context::current()? {
            Handle::Io(inner) => Some(IoManager { inner, owner: false }),
            Handle::Plain(_) => None,
        }
    }

    fn handle(&self) -> Handle {
        Handle::Io(self.inner.clone())
    }

    /// A non-owning [`Scheduler`] view of this manager.
    pub fn as_scheduler(&self) -> Scheduler {
        Scheduler::from_handle(self.handle())
    }

    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    /// Tunables this manager was built with.
    pub fn config(&self) -> Config {
        *self.inner.core.config()
    }

    /// Starts the workers. [`IoManager::new`] already does this.
    pub fn start(&self) -> Result<()> {
        self.handle().start()
    }

    /// Waits until every task, fd event and timer is done, then joins the
    /// workers.
    pub fn stop(&self) {
        self.handle().stop();
    }

    pub fn schedule(&self, task: impl Into<Task>, thread: Option<ThreadId>) {
        self.handle().schedule(task.into(), thread);
    }

    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::from_fn(f), None);
    }

    /// Registers interest in `event` on `fd`.
    ///
    /// With a callback, the callback is scheduled when the fd becomes ready.
    /// Without one, the calling fiber is the waiter and is expected to yield
    /// right after this call.
    ///
    /// Registering a direction that is already armed replaces its waiter.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFd`] for a negative fd and
    /// [`Error::EpollCtl`] if epoll rejects the registration.
    ///
    /// # Panics
    /// Panics if `callback` is `None` and the caller is not a fiber.
    pub fn add_event(&self, fd: RawFd, event: Event, callback: Option<EventCallback>) -> Result<()> {
        self.inner.add_event(fd, event, callback)
    }

    /// Removes interest in `event` without waking the waiter.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.inner.del_event(fd, event)
    }

    /// Removes interest in `event` and wakes the waiter as if it fired.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.inner.cancel_event(fd, event)
    }

    /// Removes all interest on `fd`, waking every waiter.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.inner.cancel_all(fd)
    }

    /// Number of armed (fd, direction) registrations.
    pub fn pending_event_count(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// The timer set whose callbacks this manager schedules.
    pub fn timer_manager(&self) -> &TimerManager {
        &self.inner.timers
    }

    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.timers.add_timer(ms, callback, recurring)
    }

    pub fn add_condition_timer<F, T>(&self, ms: u64, callback: F, guard: Weak<T>, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.inner.timers.add_condition_timer(ms, callback, guard, recurring)
    }

    pub fn next_timer_delay(&self) -> Option<Duration> {
        self.inner.timers.next_timer_delay()
    }

    pub fn has_timer(&self) -> bool {
        self.inner.timers.has_timer()
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        if self.owner {
            self.handle().stop();
        }
    }
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoManager")
            .field("name", &self.name())
            .field("pending_events", &self.pending_event_count())
            .field("timers", &self.inner.timers.len())
            .finish()
    }
}
