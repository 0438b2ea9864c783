//! Scheduler subsystem.

pub(crate) mod context;
pub(crate) mod queue;
pub(crate) mod scheduler;
pub(crate) mod task;

pub use scheduler::Scheduler;
pub use task::Task;
