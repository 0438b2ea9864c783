//! Syscall interception.
//!
//! The functions in this module mirror blocking libc calls. On a thread with
//! hooking enabled (every scheduler worker enables it on entry), a call that
//! would block on a socket parks the calling fiber and lets the worker run
//! something else until the socket is ready or its timeout expires.
//!
//! Call them directly (`fiberio::hook::recv(..)`) or build with the
//! `interpose` feature to have them replace the libc symbols process-wide.
//!
//! # Example
//!
//! ```ignore
//! use fiberio::{IoManager, hook};
//!
//! let iom = IoManager::new(1, false, "io")?;
//! iom.spawn(move || {
//!     let mut buf = [0u8; 64];
//!     let n = unsafe { hook::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
//!     // the worker kept running other fibers while this one waited
//! });
//! ```

mod fd;
mod io;
pub(crate) mod real;

pub use fd::{FdCtx, FdManager};
pub use io::{
    accept, close, connect, connect_with_timeout, fcntl, getsockopt, ioctl, nanosleep, read, readv,
    recv, recvfrom, recvmsg, send, sendmsg, sendto, setsockopt, sleep, socket, usleep, write,
    writev,
};

use std::cell::Cell;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Whether blocking calls on this thread are intercepted.
#[inline(never)]
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(Cell::get)
}

/// Enables or disables interception for the calling thread.
#[inline(never)]
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|flag| flag.set(enabled));
}
