//! Stackful coroutines ("fibers").
//!
//! A [`Fiber`] owns a call stack and a saved execution context. Resuming a
//! fiber ([`Fiber::swap_in`]) moves the OS thread onto that stack until the
//! fiber yields ([`yield_to_hold`], [`yield_to_ready`]) or finishes, at which
//! point control returns to the thread's *scheduler fiber*.
//!
//! Every thread that touches this module gets an implicit main fiber
//! representing its original stack. Worker threads use the main fiber as the
//! scheduler fiber; a caller-mode scheduler installs its root fiber instead.
//!
//! # State machine
//!
//! ```text
//! Init -> Exec <-> { Hold | Ready } -> Term | Except
//! ```
//!
//! A yielding fiber keeps reporting [`FiberState::Exec`] until its registers
//! are fully saved; only then does the requested state become visible. A
//! scheduler on another thread therefore never resumes a half-suspended fiber.
//!
//! # Example
//!
//! ```ignore
//! use fiberio::fiber::{self, Fiber, FiberState};
//!
//! let fiber = Fiber::new(|| {
//!     println!("step 1");
//!     fiber::yield_to_hold();
//!     println!("step 2");
//! }, 0, false)?;
//!
//! fiber.swap_in();
//! assert_eq!(fiber.state(), FiberState::Hold);
//! fiber.swap_in();
//! assert_eq!(fiber.state(), FiberState::Term);
//! ```

mod context;
pub(crate) mod stack;

use crate::config;
use crate::error::Result;

use context::{Context, switch};
use parking_lot::Mutex;
use stack::Stack;

use std::any::Any;
use std::cell::{RefCell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

type Entry = Box<dyn FnOnce() + Send + 'static>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_FIBERS: AtomicUsize = AtomicUsize::new(0);

/// Lifecycle state of a [`Fiber`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FiberState {
    /// Created or reset, never run.
    Init = 0,
    /// Suspended; someone else is responsible for resuming it.
    Hold = 1,
    /// Currently running on some thread.
    Exec = 2,
    /// Entry closure returned.
    Term = 3,
    /// Suspended and asking the scheduler to run it again.
    Ready = 4,
    /// Entry closure panicked.
    Except = 5,
}

impl FiberState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Init,
            1 => Self::Hold,
            2 => Self::Exec,
            3 => Self::Term,
            4 => Self::Ready,
            _ => Self::Except,
        }
    }

    /// True for `Term` and `Except`.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Term | Self::Except)
    }
}

/// A stackful coroutine.
///
/// Fibers are always handled through `Arc<Fiber>`: the scheduler, the reactor
/// and timers may all hold a reference to the same suspended fiber.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    /// State published once the fiber has switched out.
    parked: AtomicU8,
    use_caller: bool,
    stack: Option<Stack>,
    context: UnsafeCell<Context>,
    entry: Mutex<Option<Entry>>,
}

// The context is only touched by the thread that is switching into or out of
// the fiber, and the scheduler never resumes a fiber that is still `Exec`.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static SCHEDULER_FIBER: RefCell<Option<Weak<Fiber>>> = const { RefCell::new(None) };
}

impl Fiber {
    /// Creates a fiber that will run `entry` on its own stack.
    ///
    /// # Arguments
    /// * `entry` - closure executed on the first [`swap_in`](Self::swap_in)
    /// * `stack_size` - stack size in bytes, `0` for [`Config::stack_size`](crate::Config)
    /// * `use_caller` - when true the fiber returns to the thread's main fiber
    ///   on completion ([`back`](Self::back)) instead of the scheduler fiber
    ///
    /// # Errors
    /// Fails if the stack cannot be mapped or the context cannot be captured.
    pub fn new<F>(entry: F, stack_size: usize, use_caller: bool) -> Result<Arc<Self>>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 {
            config::get().stack_size
        } else {
            stack_size
        };
        let stack = Stack::new(size)?;
        let context = Context::with_entry(&stack, fiber_main)?;
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        log::trace!("fiber {id} created with {} byte stack", stack.size());

        Ok(Arc::new(Self {
            id,
            state: AtomicU8::new(FiberState::Init as u8),
            parked: AtomicU8::new(FiberState::Hold as u8),
            use_caller,
            stack: Some(stack),
            context: UnsafeCell::new(context),
            entry: Mutex::new(Some(Box::new(entry))),
        }))
    }

    fn new_main() -> Result<Arc<Self>> {
        let context = Context::main()?;
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);

        Ok(Arc::new(Self {
            id: 0,
            state: AtomicU8::new(FiberState::Exec as u8),
            parked: AtomicU8::new(FiberState::Exec as u8),
            use_caller: false,
            stack: None,
            context: UnsafeCell::new(context),
            entry: Mutex::new(None),
        }))
    }

    /// Returns the fiber running on this thread, creating the thread's main
    /// fiber on first use.
    ///
    /// # Panics
    /// Panics if the main fiber's context cannot be captured.
    pub fn current() -> Arc<Fiber> {
        if let Some(fiber) = current_fiber() {
            return fiber;
        }

        let main = match Fiber::new_main() {
            Ok(main) => main,
            Err(e) => panic!("cannot create main fiber for this thread: {e}"),
        };
        set_thread_main(main.clone());
        set_current(Some(main.clone()));
        main
    }

    /// Number of fibers currently alive in the process, main fibers included.
    pub fn total() -> usize {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }

    /// Unique id; `0` for thread main fibers.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether this is a thread's main fiber rather than a stackful one.
    pub fn is_main(&self) -> bool {
        self.stack.is_none()
    }

    /// Reuses a finished or never-started fiber's stack for a new entry.
    ///
    /// # Panics
    /// Panics on a main fiber or on a fiber in `Exec`, `Hold` or `Ready`.
    pub fn reset<F>(&self, entry: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(stack) = self.stack.as_ref() else {
            panic!("cannot reset a thread main fiber");
        };
        let state = self.state();
        assert!(
            matches!(state, FiberState::Init | FiberState::Term | FiberState::Except),
            "fiber {} cannot be reset while {:?}",
            self.id,
            state
        );

        // SAFETY: the fiber is not running, so nobody else touches the context.
        unsafe { (*self.context.get()).rearm(stack, fiber_main)? };
        *self.entry.lock() = Some(Box::new(entry));
        self.state.store(FiberState::Init as u8, Ordering::Release);
        log::trace!("fiber {} reset", self.id);

        Ok(())
    }

    /// Runs the fiber on the calling thread until it yields or finishes,
    /// saving the caller into the thread's scheduler fiber.
    ///
    /// Returns the state the fiber switched out in. Once published, that state
    /// may be superseded at any time by another thread resuming the fiber, so
    /// callers deciding what to do next must use the returned value rather
    /// than [`state`](Self::state).
    ///
    /// # Panics
    /// Panics if the fiber is already executing.
    pub fn swap_in(self: &Arc<Self>) -> FiberState {
        let scheduler = scheduler_fiber();
        self.resume_from(&scheduler)
    }

    /// Suspends the running fiber and resumes the thread's scheduler fiber.
    pub fn swap_out(&self) {
        self.suspend_to(scheduler_fiber());
    }

    /// Like [`swap_in`](Self::swap_in) but saves the caller into the thread's
    /// main fiber. Used to enter a caller-mode scheduler's root fiber.
    pub fn call(self: &Arc<Self>) -> FiberState {
        let main = thread_main();
        self.resume_from(&main)
    }

    /// Counterpart of [`call`](Self::call): resumes the thread's main fiber.
    pub fn back(&self) {
        self.suspend_to(thread_main());
    }

    fn resume_from(self: &Arc<Self>, from: &Arc<Fiber>) -> FiberState {
        let prev = self.state();
        assert!(
            prev != FiberState::Exec,
            "fiber {} resumed while already executing",
            self.id
        );
        assert!(!prev.is_finished(), "fiber {} resumed after it finished", self.id);

        self.parked.store(FiberState::Hold as u8, Ordering::Relaxed);
        self.state.store(FiberState::Exec as u8, Ordering::Release);
        set_current(Some(self.clone()));

        // SAFETY: `from` is the fiber running this code and `self` is not
        // running anywhere (checked above).
        unsafe { switch(from.context_ptr(), self.context_ptr()) };

        let parked = self.parked.load(Ordering::Relaxed);
        self.state.store(parked, Ordering::Release);
        FiberState::from_u8(parked)
    }

    fn suspend_to(&self, target: Arc<Fiber>) {
        let to = target.context_ptr();
        // Moving `target` into the thread-local leaves no reference on this
        // stack, so a fiber that is never resumed does not leak.
        set_current(Some(target));

        // SAFETY: the target was suspended by this thread and is waiting for us.
        unsafe { switch(self.context_ptr(), to) };
    }

    fn context_ptr(&self) -> *mut libc::ucontext_t {
        unsafe { (*self.context.get()).as_mut_ptr() }
    }

    fn park_as(&self, state: FiberState) {
        self.parked.store(state as u8, Ordering::Relaxed);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        log::trace!("fiber {} dropped in state {:?}", self.id, self.state());
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("main", &self.is_main())
            .finish()
    }
}

/// Suspends the running fiber and asks its scheduler to run it again.
///
/// # Panics
/// Panics when called outside a stackful fiber.
pub fn yield_to_ready() {
    yield_as(FiberState::Ready);
}

/// Suspends the running fiber without rescheduling it. Whoever holds a
/// reference (a timer, an fd registration) is responsible for resuming it.
///
/// # Panics
/// Panics when called outside a stackful fiber.
pub fn yield_to_hold() {
    yield_as(FiberState::Hold);
}

fn yield_as(state: FiberState) {
    let current = Fiber::current();
    assert!(!current.is_main(), "yield called outside of a fiber");
    assert_eq!(current.state(), FiberState::Exec);

    current.park_as(state);
    let raw = Arc::as_ptr(&current);
    drop(current);

    // SAFETY: the resumer keeps the fiber alive until we switch back to it.
    unsafe { (*raw).swap_out() };
}

/// Id of the fiber running on this thread, `0` outside of fibers.
pub fn current_id() -> u64 {
    CURRENT.with(|current| current.borrow().as_ref().map_or(0, |f| f.id))
}

/// Whether the caller runs inside a stackful fiber and may therefore yield.
pub fn in_fiber() -> bool {
    current_fiber().is_some_and(|f| !f.is_main())
}

/// Installs `fiber` as the fiber [`Fiber::swap_out`] returns to on this thread.
pub(crate) fn set_scheduler_fiber(fiber: &Arc<Fiber>) {
    SCHEDULER_FIBER.with(|slot| *slot.borrow_mut() = Some(Arc::downgrade(fiber)));
}

// Thread-local accessors must not be inlined: a fiber may suspend on one
// worker and resume on another, and the thread-local address must be
// recomputed after every switch.

/// Forgets the fiber installed by [`set_scheduler_fiber`]; [`Fiber::swap_out`]
/// falls back to the thread's main fiber.
pub(crate) fn clear_scheduler_fiber() {
    SCHEDULER_FIBER.with(|slot| *slot.borrow_mut() = None);
}

#[inline(never)]
fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT.with(|current| current.borrow().clone())
}

#[inline(never)]
fn set_current(fiber: Option<Arc<Fiber>>) {
    let previous = CURRENT.with(|current| current.replace(fiber));
    drop(previous);
}

#[inline(never)]
fn set_thread_main(fiber: Arc<Fiber>) {
    THREAD_MAIN.with(|main| *main.borrow_mut() = Some(fiber));
}

#[inline(never)]
fn thread_main() -> Arc<Fiber> {
    if let Some(main) = THREAD_MAIN.with(|main| main.borrow().clone()) {
        return main;
    }

    Fiber::current();
    THREAD_MAIN
        .with(|main| main.borrow().clone())
        .unwrap_or_else(|| panic!("thread main fiber missing after initialisation"))
}

#[inline(never)]
fn scheduler_fiber() -> Arc<Fiber> {
    SCHEDULER_FIBER
        .with(|slot| slot.borrow().as_ref().and_then(Weak::upgrade))
        .unwrap_or_else(thread_main)
}

extern "C" fn fiber_main() {
    let Some(fiber) = current_fiber() else {
        log::error!("fiber trampoline entered without a current fiber");
        std::process::abort();
    };

    let entry = fiber.entry.lock().take();
    let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
        if let Some(entry) = entry {
            entry();
        }
    }));

    match outcome {
        Ok(()) => fiber.park_as(FiberState::Term),
        Err(payload) => {
            fiber.park_as(FiberState::Except);
            log::error!("fiber {} panicked: {}", fiber.id, panic_message(&*payload));
        }
    }

    let use_caller = fiber.use_caller;
    let raw = Arc::as_ptr(&fiber);
    drop(fiber);

    // SAFETY: the resumer holds a reference until this final switch returns
    // control to it.
    unsafe {
        if use_caller {
            (*raw).back();
        } else {
            (*raw).swap_out();
        }
    }

    log::error!("finished fiber was resumed");
    std::process::abort();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
