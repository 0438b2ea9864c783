//! Units of work accepted by a scheduler.

use crate::fiber::Fiber;

use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

/// Something a scheduler can run: an existing fiber or a plain closure.
///
/// Closures are executed inside a per-worker fiber that is recycled between
/// callbacks, so scheduling a closure never allocates a stack of its own.
pub enum Task {
    /// Resume this fiber.
    Fiber(Arc<Fiber>),
    /// Run this closure once.
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

impl Task {
    /// Wraps a closure.
    ///
    /// # Example
    /// ```ignore
    /// scheduler.schedule(Task::from_fn(|| println!("hi")), None);
    /// ```
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Callback(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fiber(fiber) => f.debug_tuple("Fiber").field(&fiber.id()).finish(),
            Task::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// A queued task plus the worker it is pinned to, if any.
#[derive(Debug)]
pub(crate) struct ScheduledTask {
    pub(crate) task: Task,
    pub(crate) thread: Option<ThreadId>,
}

impl ScheduledTask {
    pub(crate) fn new(task: Task, thread: Option<ThreadId>) -> Self {
        Self { task, thread }
    }

    fn runs_on(&self, thread: ThreadId) -> bool {
        self.thread.is_none_or(|pinned| pinned == thread)
    }

    /// A fiber that is still switching out must not be picked up yet.
    fn is_busy(&self) -> bool {
        matches!(&self.task, Task::Fiber(fiber) if fiber.state() == crate::fiber::FiberState::Exec)
    }

    pub(crate) fn is_runnable_on(&self, thread: ThreadId) -> Runnable {
        if !self.runs_on(thread) {
            Runnable::OtherThread
        } else if self.is_busy() {
            Runnable::Busy
        } else {
            Runnable::Yes
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Runnable {
    Yes,
    OtherThread,
    Busy,
}
