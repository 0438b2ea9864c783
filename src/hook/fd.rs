//! Descriptor bookkeeping for the hook layer.
//!
//! Every socket the hook layer manages is switched to `O_NONBLOCK` behind
//! the caller's back. [`FdCtx`] remembers that, separately from whether the
//! caller asked for non-blocking mode, plus the `SO_RCVTIMEO`/`SO_SNDTIMEO`
//! timeouts the caller configured.

use crate::hook::real::real;
use crate::reactor::Event;

use parking_lot::RwLock;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

const NO_TIMEOUT: u64 = u64::MAX;
const INITIAL_SLOTS: usize = 64;

/// Hook-layer view of one file descriptor.
#[derive(Debug)]
pub struct FdCtx {
    fd: RawFd,
    is_init: AtomicBool,
    is_socket: AtomicBool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> Self {
        let ctx = Self {
            fd,
            is_init: AtomicBool::new(false),
            is_socket: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        };
        ctx.init();
        ctx
    }

    /// Inspects the descriptor and, for sockets, forces `O_NONBLOCK`.
    fn init(&self) -> bool {
        if self.is_init.load(Ordering::Acquire) {
            return true;
        }

        let mut stat = MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(self.fd, stat.as_mut_ptr()) } != 0 {
            return false;
        }
        let stat = unsafe { stat.assume_init() };
        let is_socket = stat.st_mode & libc::S_IFMT == libc::S_IFSOCK;

        if is_socket {
            let flags = unsafe { (real().fcntl)(self.fd, libc::F_GETFL) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { (real().fcntl)(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
        }

        self.is_socket.store(is_socket, Ordering::Release);
        self.sys_nonblock.store(is_socket, Ordering::Release);
        self.user_nonblock.store(false, Ordering::Release);
        self.closed.store(false, Ordering::Release);
        self.is_init.store(true, Ordering::Release);
        true
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_init(&self) -> bool {
        self.is_init.load(Ordering::Acquire)
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the runtime put the descriptor in non-blocking mode.
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    /// Whether the caller asked for non-blocking mode.
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, nonblock: bool) {
        self.user_nonblock.store(nonblock, Ordering::Release);
    }

    /// Receive (`Event::Read`) or send (`Event::Write`) timeout.
    pub fn timeout(&self, event: Event) -> Option<u64> {
        let ms = self.timeout_slot(event).load(Ordering::Acquire);
        (ms != NO_TIMEOUT).then_some(ms)
    }

    pub fn set_timeout(&self, event: Event, ms: Option<u64>) {
        self.timeout_slot(event)
            .store(ms.unwrap_or(NO_TIMEOUT), Ordering::Release);
    }

    fn timeout_slot(&self, event: Event) -> &AtomicU64 {
        match event {
            Event::Read => &self.recv_timeout_ms,
            Event::Write => &self.send_timeout_ms,
        }
    }
}

/// Process-wide table of [`FdCtx`]s indexed by descriptor.
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    fn new() -> Self {
        Self {
            slots: RwLock::new(vec![None; INITIAL_SLOTS]),
        }
    }

    /// The shared instance.
    pub fn global() -> &'static FdManager {
        static GLOBAL: OnceLock<FdManager> = OnceLock::new();
        GLOBAL.get_or_init(FdManager::new)
    }

    /// Looks up `fd`, creating its context when `auto_create` is set.
    ///
    /// Creating a context for a socket switches it to non-blocking mode.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let index = fd as usize;

        {
            let slots = self.slots.read();
            match slots.get(index) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut slots = self.slots.write();
        if index >= slots.len() {
            let target = (index * 3 / 2).max(index + 1);
            slots.resize(target, None);
        }

        Some(slots[index].get_or_insert_with(|| Arc::new(FdCtx::new(fd))).clone())
    }

    /// Forgets `fd`.
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }

        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}
