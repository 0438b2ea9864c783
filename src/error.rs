//! Error type shared by every fallible runtime operation.
//!
//! Only resource and OS-level failures are reported through [`Error`].
//! Misuse of the runtime (resuming a running fiber, stopping a caller-mode
//! scheduler from a foreign thread, ...) is a programming error and panics.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

/// Errors surfaced by the scheduler, reactor and fiber constructors.
#[derive(Debug, Error)]
pub enum Error {
    /// `epoll_create1` failed.
    #[error("failed to create epoll instance: {0}")]
    Epoll(#[source] io::Error),

    /// `epoll_ctl` rejected a registration change.
    #[error("epoll_ctl({op}) failed for fd {fd}: {source}")]
    EpollCtl {
        op: &'static str,
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// The wake-up pipe could not be created or configured.
    #[error("failed to create wake-up pipe: {0}")]
    Pipe(#[source] io::Error),

    /// A fiber stack could not be mapped.
    #[error("failed to allocate a {size} byte fiber stack: {source}")]
    Stack {
        size: usize,
        #[source]
        source: io::Error,
    },

    /// `getcontext` failed while preparing a fiber.
    #[error("failed to capture execution context: {0}")]
    Context(#[source] io::Error),

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    /// A negative file descriptor was handed to the reactor.
    #[error("invalid file descriptor {0}")]
    InvalidFd(RawFd),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
