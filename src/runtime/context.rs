//! Thread-local "current scheduler" slot.
//!
//! Worker threads record the scheduler they serve when they enter the worker
//! loop. Hooked syscalls and [`Scheduler::current`](crate::Scheduler::current)
//! read it back without an explicit handle.
//!
//! The slot holds a weak reference: a thread never keeps its scheduler alive.

use crate::runtime::scheduler::{Handle, WeakHandle};

use std::cell::RefCell;

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<WeakHandle>> = const { RefCell::new(None) };
}

/// Sets the scheduler this thread works for, returning the previous one.
#[inline(never)]
pub(crate) fn set_current(handle: Option<WeakHandle>) -> Option<WeakHandle> {
    CURRENT_SCHEDULER.with(|current| current.replace(handle))
}

/// Returns the scheduler this thread works for, if it is still alive.
#[inline(never)]
pub(crate) fn current() -> Option<Handle> {
    CURRENT_SCHEDULER.with(|current| current.borrow().as_ref().and_then(WeakHandle::upgrade))
}
