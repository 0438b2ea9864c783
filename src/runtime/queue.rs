//! Shared FIFO of pending tasks.
//!
//! Every worker scans the same queue under one mutex. A worker takes the
//! first task it is allowed to run and reports whether other workers should
//! be woken for what it had to skip.

use crate::runtime::task::{Runnable, ScheduledTask};

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;

/// A thread-safe FIFO of [`ScheduledTask`]s.
pub(crate) struct TaskQueue {
    tasks: Mutex<VecDeque<ScheduledTask>>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends a task.
    ///
    /// # Returns
    /// `true` if the queue was empty before the push, meaning idle workers
    /// may need a wake-up.
    pub(crate) fn push(&self, task: ScheduledTask) -> bool {
        let mut tasks = self.tasks.lock();
        let was_empty = tasks.is_empty();
        tasks.push_back(task);
        was_empty
    }

    /// Appends several tasks under a single lock acquisition.
    pub(crate) fn push_batch<I>(&self, batch: I) -> bool
    where
        I: IntoIterator<Item = ScheduledTask>,
    {
        let mut tasks = self.tasks.lock();
        let was_empty = tasks.is_empty();
        tasks.extend(batch);
        was_empty && !tasks.is_empty()
    }

    /// Removes the first task `thread` may run.
    ///
    /// `active` is incremented under the queue lock when a task is taken, so
    /// an observer never sees an empty queue and zero active tasks while a
    /// task is in flight.
    ///
    /// # Returns
    /// The task, if any, and whether another worker should be tickled because
    /// work was skipped or left behind.
    pub(crate) fn take_next(
        &self,
        thread: ThreadId,
        active: &AtomicUsize,
    ) -> (Option<ScheduledTask>, bool) {
        let mut tasks = self.tasks.lock();
        let mut tickle = false;

        let mut found = None;
        for (index, task) in tasks.iter().enumerate() {
            match task.is_runnable_on(thread) {
                Runnable::Yes => {
                    found = Some(index);
                    break;
                }
                Runnable::OtherThread | Runnable::Busy => tickle = true,
            }
        }

        let task = found.and_then(|index| tasks.remove(index));
        if task.is_some() {
            active.fetch_add(1, Ordering::SeqCst);
            tickle |= !tasks.is_empty();
        }

        (task, tickle)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}
