//! Fluent builder for schedulers and I/O managers.
//!
//! Collects the scheduler parameters plus a copy of the [`Config`] tunables.
//! The tunables belong to the runtime being built; the process-wide
//! configuration is only read, as the starting point.

use crate::config::{self, Config};
use crate::error::Result;
use crate::reactor::IoManager;
use crate::runtime::Scheduler;

use std::time::Duration;

/// Builder for [`IoManager`] and [`Scheduler`] instances.
///
/// # Example
/// ```ignore
/// let iom = RuntimeBuilder::new()
///     .workers(4)
///     .name("net")
///     .connect_timeout(Duration::from_secs(2))
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeBuilder {
    workers: usize,
    use_caller: bool,
    name: String,
    config: Config,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    /// Creates a builder with one worker, no caller mode, and a copy of the
    /// current process-wide configuration.
    pub fn new() -> Self {
        Self {
            workers: 1,
            use_caller: false,
            name: "fiberio".to_string(),
            config: config::get(),
        }
    }

    /// Total worker threads, the caller included in caller mode.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Makes the building thread one of the workers.
    pub fn use_caller(mut self, use_caller: bool) -> Self {
        self.use_caller = use_caller;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Stack size for the runtime's worker, idle and callback fibers.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        if bytes > 0 {
            self.config.stack_size = bytes;
        }
        self
    }

    /// Timeout used by the hooked `connect` on the runtime's workers.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Upper bound on one `epoll_wait`.
    pub fn max_poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.max_poll_timeout_ms = (timeout.as_millis() as u64).max(1);
        self
    }

    /// Replaces every tunable at once.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Builds a started [`IoManager`] owning the collected configuration.
    ///
    /// # Errors
    /// Propagates any failure from [`IoManager::with_config`].
    pub fn build(self) -> Result<IoManager> {
        IoManager::with_config(self.workers, self.use_caller, &self.name, self.config)
    }

    /// Builds a stopped plain [`Scheduler`] owning the collected configuration.
    pub fn build_scheduler(self) -> Result<Scheduler> {
        Scheduler::with_config(self.workers, self.use_caller, &self.name, self.config)
    }
}
