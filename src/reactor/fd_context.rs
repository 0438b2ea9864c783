//! Per-descriptor registration state.
//!
//! Each fd the reactor has seen gets one [`FdContext`] holding the epoll
//! interest mask and, per direction, who is waiting and on which scheduler
//! it should be resumed.

use crate::fiber::Fiber;
use crate::reactor::event::Event;
use crate::runtime::scheduler::WeakHandle;
use crate::runtime::task::Task;

use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Closure run when a registered direction becomes ready.
pub type EventCallback = Box<dyn FnOnce() + Send + 'static>;

/// Whoever is parked on one direction of an fd.
pub(crate) enum Waiter {
    Fiber(Arc<Fiber>),
    Callback(EventCallback),
}

impl From<Waiter> for Task {
    fn from(waiter: Waiter) -> Self {
        match waiter {
            Waiter::Fiber(fiber) => Task::Fiber(fiber),
            Waiter::Callback(callback) => Task::Callback(callback),
        }
    }
}

#[derive(Default)]
pub(crate) struct EventContext {
    pub(crate) scheduler: Option<WeakHandle>,
    pub(crate) waiter: Option<Waiter>,
}

impl EventContext {
    fn take(&mut self) -> (Option<WeakHandle>, Option<Waiter>) {
        (self.scheduler.take(), self.waiter.take())
    }
}

#[derive(Default)]
pub(crate) struct FdState {
    /// Registered epoll interest, a combination of [`Event::READ`] and
    /// [`Event::WRITE`].
    pub(crate) events: u32,
    read: EventContext,
    write: EventContext,
}

impl FdState {
    pub(crate) fn has(&self, event: Event) -> bool {
        self.events & event.mask() != 0
    }

    pub(crate) fn context_mut(&mut self, event: Event) -> &mut EventContext {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// Forgets the waiter for `event` without waking it.
    pub(crate) fn clear(&mut self, event: Event) {
        self.events &= !event.mask();
        self.context_mut(event).take();
    }

    /// Removes `event` from the interest mask and schedules its waiter.
    ///
    /// Triggering a direction that is not armed does nothing, so a timeout
    /// racing a genuine readiness event wakes the waiter only once.
    pub(crate) fn trigger(&mut self, event: Event) -> bool {
        if !self.has(event) {
            return false;
        }
        self.events &= !event.mask();

        let (scheduler, waiter) = self.context_mut(event).take();
        match (scheduler.and_then(|s| s.upgrade()), waiter) {
            (Some(scheduler), Some(waiter)) => {
                scheduler.schedule(waiter.into(), None);
                true
            }
            (None, Some(_)) => {
                log::warn!("dropping {event:?} waiter: its scheduler is gone");
                false
            }
            _ => false,
        }
    }
}

/// Registration state for one file descriptor.
pub(crate) struct FdContext {
    pub(crate) fd: RawFd,
    pub(crate) state: Mutex<FdState>,
}

impl FdContext {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self {
            fd,
            state: Mutex::new(FdState::default()),
        }
    }
}
