//! M:N scheduler: a pool of OS threads cooperatively running fibers.
//!
//! The scheduler owns a [`TaskQueue`] shared by all workers. Each worker
//! runs [`run`], which repeatedly takes the first task it may execute and
//! swaps it in. When nothing is runnable, the worker swaps in its idle fiber,
//! whose behaviour depends on the kind of scheduler:
//!
//! - a plain [`Scheduler`] yields in a loop until it is stopping,
//! - an [`IoManager`](crate::IoManager) blocks in `epoll_wait`.
//!
//! The two kinds are modelled by [`Handle`], which dispatches the `tickle`,
//! `idle` and `stopping` hooks.
//!
//! # Caller mode
//!
//! With `use_caller`, the thread that creates the scheduler becomes one of
//! its workers. That thread only runs the worker loop from inside a root
//! fiber, which is entered when [`Scheduler::stop`] is called.
//!
//! # Example
//!
//! ```ignore
//! use fiberio::{Scheduler, Task};
//!
//! let scheduler = Scheduler::new(2, false, "pool")?;
//! scheduler.start()?;
//! scheduler.schedule(Task::from_fn(|| println!("hello from a fiber")), None);
//! scheduler.stop();
//! ```

use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::fiber::{self, Fiber, FiberState};
use crate::hook;
use crate::reactor::core::IoInner;
use crate::runtime::context;
use crate::runtime::queue::TaskQueue;
use crate::runtime::task::{ScheduledTask, Task};

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

/// State shared by every scheduler kind.
pub(crate) struct Core {
    name: String,
    config: Config,
    pub(crate) queue: TaskQueue,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: RwLock<Vec<ThreadId>>,
    /// Threads to spawn, not counting a caller-mode root thread.
    worker_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    /// `true` until started and again once a stop is requested.
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    stopped: AtomicBool,
    root_thread: Option<ThreadId>,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
}

impl Core {
    pub(crate) fn new(workers: usize, use_caller: bool, name: &str, config: Config) -> Self {
        assert!(workers > 0, "a scheduler needs at least one worker");

        let (worker_count, root_thread) = if use_caller {
            (workers - 1, Some(thread::current().id()))
        } else {
            (workers, None)
        };

        Self {
            name: name.to_string(),
            config,
            queue: TaskQueue::new(),
            threads: Mutex::new(Vec::new()),
            thread_ids: RwLock::new(root_thread.into_iter().collect()),
            worker_count,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            root_thread,
            root_fiber: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Tunables this scheduler was built with.
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn thread_ids(&self) -> Vec<ThreadId> {
        self.thread_ids.read().clone()
    }

    /// Base stop condition: a stop was requested, no task is queued and none
    /// is running.
    pub(crate) fn stopping(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.stopping.load(Ordering::SeqCst)
            && self.queue.is_empty()
            && self.active.load(Ordering::SeqCst) == 0
    }
}

/// A strong reference to a scheduler of either kind.
#[derive(Clone)]
pub(crate) enum Handle {
    Plain(Arc<Core>),
    Io(Arc<IoInner>),
}

/// The weak counterpart of [`Handle`].
#[derive(Clone)]
pub(crate) enum WeakHandle {
    Plain(Weak<Core>),
    Io(Weak<IoInner>),
}

impl WeakHandle {
    pub(crate) fn upgrade(&self) -> Option<Handle> {
        match self {
            WeakHandle::Plain(core) => core.upgrade().map(Handle::Plain),
            WeakHandle::Io(inner) => inner.upgrade().map(Handle::Io),
        }
    }
}

impl Handle {
    pub(crate) fn core(&self) -> &Core {
        match self {
            Handle::Plain(core) => core,
            Handle::Io(inner) => inner.core(),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakHandle {
        match self {
            Handle::Plain(core) => WeakHandle::Plain(Arc::downgrade(core)),
            Handle::Io(inner) => WeakHandle::Io(Arc::downgrade(inner)),
        }
    }

    fn ptr_eq(&self, other: &Handle) -> bool {
        std::ptr::eq(self.core(), other.core())
    }

    /// Wakes an idle worker. No-op for a plain scheduler, whose idle fiber
    /// polls the queue anyway.
    pub(crate) fn tickle(&self) {
        match self {
            Handle::Plain(_) => {}
            Handle::Io(inner) => inner.tickle(),
        }
    }

    pub(crate) fn stopping(&self) -> bool {
        match self {
            Handle::Plain(core) => core.stopping(),
            Handle::Io(inner) => inner.stopping(),
        }
    }

    fn idle(&self) {
        match self {
            Handle::Plain(core) => {
                log::trace!("{}: idle", core.name);
                while !core.stopping() {
                    thread::yield_now();
                    fiber::yield_to_hold();
                }
            }
            Handle::Io(inner) => inner.idle(),
        }
    }

    pub(crate) fn schedule(&self, task: Task, thread: Option<ThreadId>) {
        if self.core().queue.push(ScheduledTask::new(task, thread)) {
            self.tickle();
        }
    }

    pub(crate) fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let batch = tasks.into_iter().map(|task| ScheduledTask::new(task, None));
        if self.core().queue.push_batch(batch) {
            self.tickle();
        }
    }

    /// Creates the root fiber of a caller-mode scheduler and installs the
    /// caller as one of its workers. Must run on the creating thread.
    pub(crate) fn install_caller(&self) -> Result<()> {
        let core = self.core();
        if core.root_thread.is_none() {
            return Ok(());
        }

        let weak = self.downgrade();
        let root = Fiber::new(
            move || {
                if let Some(handle) = weak.upgrade() {
                    run(handle);
                }
            },
            core.config.stack_size,
            true,
        )?;

        Fiber::current();
        fiber::set_scheduler_fiber(&root);
        context::set_current(Some(self.downgrade()));
        *core.root_fiber.lock() = Some(root);

        Ok(())
    }

    pub(crate) fn start(&self) -> Result<()> {
        let core = self.core();
        let mut threads = core.threads.lock();

        if core.stopped.load(Ordering::SeqCst) {
            log::warn!("{}: start called after stop, ignoring", core.name);
            return Ok(());
        }
        if !core.stopping.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        for index in 0..core.worker_count {
            let handle = self.clone();
            let join = thread::Builder::new()
                .name(format!("{}_{}", core.name, index))
                .spawn(move || run(handle))
                .map_err(|e| {
                    log::error!("{}: failed to spawn worker {index}: {e}", core.name);
                    Error::Spawn(e)
                })?;

            core.thread_ids.write().push(join.thread().id());
            threads.push(join);
        }

        log::debug!(
            "{}: started with {} worker thread(s){}",
            core.name,
            core.worker_count,
            if core.root_thread.is_some() { " plus caller" } else { "" }
        );
        Ok(())
    }

    pub(crate) fn stop(&self) {
        let core = self.core();
        if core.stopped.load(Ordering::SeqCst) {
            return;
        }
        core.auto_stop.store(true, Ordering::SeqCst);

        let root = core.root_fiber.lock().clone();
        let me = thread::current().id();

        if let Some(root) = &root
            && core.worker_count == 0
            && matches!(root.state(), FiberState::Init | FiberState::Term)
        {
            core.stopping.store(true, Ordering::SeqCst);
            if self.stopping() {
                self.finish_stop(Some(root.clone()));
                return;
            }
        }

        match core.root_thread {
            Some(root_thread) => assert_eq!(
                me, root_thread,
                "{}: a caller-mode scheduler must be stopped from the thread that created it",
                core.name
            ),
            None => assert!(
                !core.thread_ids.read().contains(&me),
                "{}: a scheduler cannot be stopped from one of its own workers",
                core.name
            ),
        }

        core.stopping.store(true, Ordering::SeqCst);
        for _ in 0..core.worker_count {
            self.tickle();
        }

        if let Some(root) = &root {
            self.tickle();
            if !self.stopping() && !root.state().is_finished() {
                root.call();
            }
        }

        self.finish_stop(root);
    }

    fn finish_stop(&self, root: Option<Arc<Fiber>>) {
        let core = self.core();
        let threads = std::mem::take(&mut *core.threads.lock());
        for join in threads {
            if join.join().is_err() {
                log::error!("{}: a worker thread panicked", core.name);
            }
        }

        if root.is_some() {
            *core.root_fiber.lock() = None;
            fiber::clear_scheduler_fiber();
            context::set_current(None);
            hook::set_hook_enabled(false);
        }

        core.stopped.store(true, Ordering::SeqCst);
        log::debug!("{}: stopped", core.name);
    }
}

/// The worker loop. Runs on every worker thread and, in caller mode, inside
/// the root fiber.
pub(crate) fn run(handle: Handle) {
    let core = handle.core();
    let me = thread::current().id();
    log::debug!("{}: worker {:?} entering", core.name, me);

    hook::set_hook_enabled(true);
    let is_root = core.root_thread == Some(me);
    if !is_root {
        context::set_current(Some(handle.downgrade()));
        Fiber::current();
    }

    let idle_handle = handle.downgrade();
    let idle_fiber = match Fiber::new(
        move || {
            if let Some(handle) = idle_handle.upgrade() {
                handle.idle();
            }
        },
        core.config.stack_size,
        false,
    ) {
        Ok(fiber) => fiber,
        Err(e) => {
            log::error!("{}: cannot create idle fiber: {e}", core.name);
            return;
        }
    };

    let mut callback_fiber: Option<Arc<Fiber>> = None;

    loop {
        let (mut next, tickle_other) = core.queue.take_next(me, &core.active);
        if tickle_other {
            handle.tickle();
        }

        if next.is_none() {
            // Counted as idle before the second look: a push racing with the
            // first one saw no idle worker and did not tickle.
            core.idle.fetch_add(1, Ordering::SeqCst);
            next = core.queue.take_next(me, &core.active).0;
            if next.is_none() {
                if idle_fiber.state().is_finished() {
                    core.idle.fetch_sub(1, Ordering::SeqCst);
                    log::debug!("{}: idle fiber finished on {:?}", core.name, me);
                    break;
                }
                idle_fiber.swap_in();
            }
            core.idle.fetch_sub(1, Ordering::SeqCst);
        }

        let Some(ScheduledTask { task, .. }) = next else {
            continue;
        };

        // Decisions below use the state returned by `swap_in`. Re-reading it
        // would race with another worker that already resumed the fiber.
        match task {
            Task::Fiber(fiber) => {
                let state = match fiber.state() {
                    state if state.is_finished() => state,
                    _ => fiber.swap_in(),
                };
                core.active.fetch_sub(1, Ordering::SeqCst);

                if state == FiberState::Ready {
                    handle.schedule(Task::Fiber(fiber), None);
                }
            }
            Task::Callback(callback) => {
                let fiber = match callback_fiber.take() {
                    Some(fiber) => fiber.reset(callback).map(|()| fiber),
                    None => Fiber::new(callback, core.config.stack_size, false),
                };
                let fiber = match fiber {
                    Ok(fiber) => fiber,
                    Err(e) => {
                        log::error!("{}: dropping callback, no fiber to run it: {e}", core.name);
                        core.active.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                };

                let state = fiber.swap_in();
                core.active.fetch_sub(1, Ordering::SeqCst);

                match state {
                    FiberState::Ready => handle.schedule(Task::Fiber(fiber), None),
                    FiberState::Term | FiberState::Except => callback_fiber = Some(fiber),
                    // Parked: whoever will resume it holds its own reference.
                    _ => {}
                }
            }
        }
    }

    if !is_root {
        context::set_current(None);
        hook::set_hook_enabled(false);
    }
    log::debug!("{}: worker {:?} exiting", core.name, me);
}

/// A fiber scheduler over a fixed pool of worker threads.
///
/// The value returned by [`Scheduler::new`] owns the scheduler: dropping it
/// stops the workers. Values returned by [`Scheduler::current`] are borrowed
/// views and stop nothing on drop.
pub struct Scheduler {
    handle: Handle,
    owner: bool,
}

impl Scheduler {
    /// Creates a stopped scheduler.
    ///
    /// # Arguments
    /// * `workers` - total number of worker threads, including the caller in
    ///   caller mode; must be at least one
    /// * `use_caller` - make the calling thread one of the workers
    /// * `name` - used for worker thread names and log lines
    ///
    /// # Errors
    /// Fails in caller mode if the root fiber cannot be allocated.
    pub fn new(workers: usize, use_caller: bool, name: &str) -> Result<Self> {
        Self::with_config(workers, use_caller, name, config::get())
    }

    /// Like [`new`](Self::new), with tunables private to this scheduler
    /// instead of the process-wide [`config`](crate::config).
    pub fn with_config(workers: usize, use_caller: bool, name: &str, config: Config) -> Result<Self> {
        let handle = Handle::Plain(Arc::new(Core::new(workers, use_caller, name, config)));
        handle.install_caller()?;

        Ok(Self {
            handle,
            owner: true,
        })
    }

    pub(crate) fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            owner: false,
        }
    }

    /// The scheduler the calling thread works for, if any.
    pub fn current() -> Option<Scheduler> {
        context::current().map(Scheduler::from_handle)
    }

    pub fn name(&self) -> &str {
        self.handle.core().name()
    }

    /// Tunables this scheduler was built with.
    pub fn config(&self) -> Config {
        *self.handle.core().config()
    }

    /// Ids of every thread running the worker loop, the caller included.
    pub fn worker_ids(&self) -> Vec<ThreadId> {
        self.handle.core().thread_ids()
    }

    pub fn has_idle_threads(&self) -> bool {
        self.handle.core().has_idle_threads()
    }

    /// Spawns the worker threads. Calling it again is a no-op.
    ///
    /// # Errors
    /// Returns [`Error::Spawn`] if a thread cannot be created.
    pub fn start(&self) -> Result<()> {
        self.handle.start()
    }

    /// Runs every queued task to completion, then joins the workers.
    ///
    /// # Panics
    /// Panics when a caller-mode scheduler is stopped from a thread other than
    /// its creator, or when called from one of the scheduler's own workers.
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Queues `task`, optionally pinned to one worker thread.
    pub fn schedule(&self, task: impl Into<Task>, thread: Option<ThreadId>) {
        self.handle.schedule(task.into(), thread);
    }

    /// Queues several unpinned tasks with a single lock acquisition.
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        self.handle.schedule_batch(tasks);
    }

    /// Queues a closure on any worker.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::from_fn(f), None);
    }

    /// Moves the calling fiber onto this scheduler, optionally onto a given
    /// worker, by requeueing it and yielding.
    ///
    /// Returns immediately when the fiber already runs where requested.
    ///
    /// # Panics
    /// Panics when called outside a fiber.
    pub fn switch_to(&self, thread: Option<ThreadId>) {
        assert!(fiber::in_fiber(), "switch_to must be called from a fiber");

        let here = context::current().is_some_and(|current| current.ptr_eq(&self.handle));
        if here && thread.is_none_or(|t| t == thread::current().id()) {
            return;
        }

        self.handle.schedule(Task::Fiber(Fiber::current()), thread);
        fiber::yield_to_hold();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.owner {
            self.handle.stop();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name())
            .field("owner", &self.owner)
            .finish()
    }
}
