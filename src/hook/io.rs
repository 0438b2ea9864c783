//! Fiber-aware replacements for blocking libc calls.
//!
//! Every function keeps the POSIX signature and errno contract of the call
//! it replaces. On a thread with hooking enabled, a call that would block on
//! a managed socket parks the calling fiber in the [`IoManager`] instead of
//! blocking the OS thread; everywhere else it behaves exactly like libc.
//!
//! With the `interpose` feature these functions are exported under their
//! libc names.

use crate::config;
use crate::fiber::{self, Fiber};
use crate::hook::fd::FdManager;
use crate::hook::is_hook_enabled;
use crate::hook::real::real;
use crate::reactor::{Event, IoManager};
use crate::runtime::context;

use libc::{
    c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec,
    useconds_t,
};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

fn set_errno(code: c_int) {
    unsafe { *libc::__errno_location() = code };
}

/// `sec` seconds plus `extra_ms`, in milliseconds. Negative seconds count as
/// zero and huge values saturate instead of wrapping.
fn to_millis(sec: libc::time_t, extra_ms: u64) -> u64 {
    (sec.max(0) as u64).saturating_mul(1000).saturating_add(extra_ms)
}

/// Shared between a parked call and its timeout timer.
struct TimerInfo {
    /// errno to report, `0` while not cancelled.
    cancelled: AtomicI32,
}

/// Parks the calling fiber until `event` fires on `fd` or `timeout_ms`
/// elapses.
///
/// # Returns
/// `Ok(())` after a wake-up that may mean readiness, `Err(errno)` after a
/// timeout, `Err(0)` when the reactor refused the registration.
fn park(iom: &IoManager, fd: RawFd, event: Event, timeout_ms: Option<u64>) -> Result<(), c_int> {
    let info = Arc::new(TimerInfo {
        cancelled: AtomicI32::new(0),
    });

    let timer = timeout_ms.map(|ms| {
        let weak = Arc::downgrade(&info);
        iom.add_condition_timer(
            ms,
            move || {
                let Some(info) = weak.upgrade() else {
                    return;
                };
                if info.cancelled.swap(libc::ETIMEDOUT, Ordering::SeqCst) != 0 {
                    return;
                }
                if let Some(iom) = IoManager::current() {
                    iom.cancel_event(fd, event);
                }
            },
            Arc::downgrade(&info),
            false,
        )
    });

    if let Err(e) = iom.add_event(fd, event, None) {
        log::warn!("cannot park on fd {fd} for {event:?}, blocking instead: {e}");
        if let Some(timer) = &timer {
            timer.cancel();
        }
        return Err(0);
    }

    fiber::yield_to_hold();

    if let Some(timer) = &timer {
        timer.cancel();
    }
    match info.cancelled.load(Ordering::SeqCst) {
        0 => Ok(()),
        code => Err(code),
    }
}

/// Blocks the OS thread in `poll` until `fd` is ready for `event`.
///
/// Used where a fiber cannot be parked. Returns `false` and sets `ETIMEDOUT`
/// when `timeout_ms` elapses first.
fn wait_blocking(fd: RawFd, event: Event, timeout_ms: Option<u64>) -> bool {
    let mut pollfd = libc::pollfd {
        fd,
        events: match event {
            Event::Read => libc::POLLIN,
            Event::Write => libc::POLLOUT,
        },
        revents: 0,
    };
    let timeout = timeout_ms.map_or(-1, |ms| ms.min(c_int::MAX as u64) as c_int);

    loop {
        match unsafe { libc::poll(&mut pollfd, 1, timeout) } {
            0 => {
                set_errno(libc::ETIMEDOUT);
                return false;
            }
            n if n > 0 => return true,
            _ if errno() == libc::EINTR => continue,
            _ => return false,
        }
    }
}

/// Runs `op` with fiber-aware retry semantics.
///
/// Calls straight through unless hooking is enabled, `fd` is a managed
/// socket and the caller did not ask for non-blocking mode.
fn do_io<F>(fd: RawFd, name: &str, event: Event, mut op: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !is_hook_enabled() {
        return op();
    }

    let Some(ctx) = FdManager::global().get(fd, false) else {
        return op();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return op();
    }

    let timeout_ms = ctx.timeout(event);
    let iom = IoManager::current().filter(|_| fiber::in_fiber());

    loop {
        let mut n = op();
        while n == -1 && errno() == libc::EINTR {
            n = op();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        log::trace!("{name}({fd}) would block, parking fiber {}", fiber::current_id());
        let parked = match &iom {
            Some(iom) => park(iom, fd, event, timeout_ms),
            None => Err(0),
        };

        match parked {
            Ok(()) => {}
            Err(0) => {
                if !wait_blocking(fd, event, timeout_ms) {
                    return -1;
                }
            }
            Err(code) => {
                set_errno(code);
                return -1;
            }
        }
    }
}

/// Suspends the calling fiber for `ms` milliseconds.
///
/// Returns `false` when the caller cannot be suspended this way and should
/// sleep for real.
fn fiber_sleep(ms: u64) -> bool {
    if !is_hook_enabled() || !fiber::in_fiber() {
        return false;
    }
    let Some(iom) = IoManager::current() else {
        return false;
    };

    let fiber = Fiber::current();
    iom.add_timer(
        ms,
        move || {
            if let Some(iom) = IoManager::current() {
                iom.schedule(fiber.clone(), None);
            }
        },
        false,
    );
    fiber::yield_to_hold();
    true
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn sleep(seconds: c_uint) -> c_uint {
    if fiber_sleep(u64::from(seconds) * 1000) {
        return 0;
    }
    unsafe { (real().sleep)(seconds) }
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn usleep(usec: useconds_t) -> c_int {
    if fiber_sleep(u64::from(usec) / 1000) {
        return 0;
    }
    unsafe { (real().usleep)(usec) }
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    if !req.is_null() {
        let (sec, nsec) = unsafe { ((*req).tv_sec, (*req).tv_nsec) };
        if sec >= 0 && (0..1_000_000_000).contains(&nsec) {
            let ms = to_millis(sec, nsec as u64 / 1_000_000);
            if fiber_sleep(ms) {
                if !rem.is_null() {
                    unsafe {
                        (*rem).tv_sec = 0;
                        (*rem).tv_nsec = 0;
                    }
                }
                return 0;
            }
        }
    }
    unsafe { (real().nanosleep)(req, rem) }
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { (real().socket)(domain, ty, protocol) };
    if fd >= 0 && is_hook_enabled() {
        FdManager::global().get(fd, true);
    }
    fd
}

/// `connect` with an explicit timeout; `None` waits indefinitely.
///
/// # Safety
/// Same contract as `connect(2)`.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const sockaddr,
    len: socklen_t,
    timeout_ms: Option<u64>,
) -> c_int {
    if !is_hook_enabled() {
        return unsafe { (real().connect)(fd, addr, len) };
    }

    let Some(ctx) = FdManager::global().get(fd, false) else {
        return unsafe { (real().connect)(fd, addr, len) };
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return unsafe { (real().connect)(fd, addr, len) };
    }

    let n = unsafe { (real().connect)(fd, addr, len) };
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let parked = match IoManager::current().filter(|_| fiber::in_fiber()) {
        Some(iom) => park(&iom, fd, Event::Write, timeout_ms),
        None => Err(0),
    };
    match parked {
        Ok(()) => {}
        Err(0) => {
            if !wait_blocking(fd, Event::Write, timeout_ms) {
                return -1;
            }
        }
        Err(code) => {
            set_errno(code);
            return -1;
        }
    }

    let mut error: c_int = 0;
    let mut error_len = size_of::<c_int>() as socklen_t;
    let ret = unsafe {
        (real().getsockopt)(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut c_int as *mut c_void,
            &mut error_len,
        )
    };
    if ret == -1 {
        return -1;
    }
    if error != 0 {
        set_errno(error);
        return -1;
    }
    0
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    let timeout = context::current().map_or_else(
        || config::get().connect_timeout_ms,
        |handle| handle.core().config().connect_timeout_ms,
    );
    unsafe { connect_with_timeout(fd, addr, len, Some(timeout)) }
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    let client = do_io(fd, "accept", Event::Read, || unsafe {
        (real().accept)(fd, addr, len) as ssize_t
    }) as c_int;

    if client >= 0 && is_hook_enabled() {
        FdManager::global().get(client, true);
    }
    client
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", Event::Read, || unsafe { (real().read)(fd, buf, count) })
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", Event::Read, || unsafe { (real().readv)(fd, iov, iovcnt) })
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "recv", Event::Read, || unsafe { (real().recv)(fd, buf, len, flags) })
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    addr: *mut sockaddr,
    addr_len: *mut socklen_t,
) -> ssize_t {
    do_io(fd, "recvfrom", Event::Read, || unsafe {
        (real().recvfrom)(fd, buf, len, flags, addr, addr_len)
    })
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "recvmsg", Event::Read, || unsafe { (real().recvmsg)(fd, msg, flags) })
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", Event::Write, || unsafe { (real().write)(fd, buf, count) })
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", Event::Write, || unsafe { (real().writev)(fd, iov, iovcnt) })
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "send", Event::Write, || unsafe { (real().send)(fd, buf, len, flags) })
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    addr: *const sockaddr,
    addr_len: socklen_t,
) -> ssize_t {
    do_io(fd, "sendto", Event::Write, || unsafe {
        (real().sendto)(fd, buf, len, flags, addr, addr_len)
    })
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "sendmsg", Event::Write, || unsafe { (real().sendmsg)(fd, msg, flags) })
}

/// Closes `fd`, first waking every fiber parked on it.
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if !is_hook_enabled() {
        return unsafe { (real().close)(fd) };
    }

    if let Some(ctx) = FdManager::global().get(fd, false) {
        ctx.mark_closed();
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        FdManager::global().remove(fd);
    }
    unsafe { (real().close)(fd) }
}

/// `fcntl` with the variadic argument taken as one machine word.
///
/// `F_SETFL`/`F_GETFL` on a managed socket record and report the caller's
/// `O_NONBLOCK` intent while the descriptor itself stays non-blocking.
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_ulong) -> c_int {
    let managed = || {
        FdManager::global()
            .get(fd, false)
            .filter(|ctx| !ctx.is_closed() && ctx.is_socket())
    };

    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            if let Some(ctx) = managed() {
                ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                if ctx.sys_nonblock() {
                    flags |= libc::O_NONBLOCK;
                } else {
                    flags &= !libc::O_NONBLOCK;
                }
            }
            unsafe { (real().fcntl)(fd, cmd, flags) }
        }
        libc::F_GETFL => {
            let flags = unsafe { (real().fcntl)(fd, cmd) };
            match managed() {
                Some(ctx) if flags >= 0 => {
                    if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => unsafe { (real().fcntl)(fd, cmd, arg) },
    }
}

/// `ioctl` with the variadic argument taken as a pointer.
///
/// `FIONBIO` on a managed socket only records the caller's intent.
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong && !arg.is_null() {
        let ctx = FdManager::global()
            .get(fd, false)
            .filter(|ctx| !ctx.is_closed() && ctx.is_socket());
        if let Some(ctx) = ctx {
            let nonblock = unsafe { *(arg as *const c_int) } != 0;
            ctx.set_user_nonblock(nonblock);
            if ctx.sys_nonblock() {
                return 0;
            }
        }
    }
    unsafe { (real().ioctl)(fd, request, arg) }
}

#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn getsockopt(
    fd: c_int,
    level: c_int,
    name: c_int,
    value: *mut c_void,
    len: *mut socklen_t,
) -> c_int {
    unsafe { (real().getsockopt)(fd, level, name, value, len) }
}

/// Records `SO_RCVTIMEO`/`SO_SNDTIMEO` so parked calls honour them.
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    name: c_int,
    value: *const c_void,
    len: socklen_t,
) -> c_int {
    if is_hook_enabled()
        && level == libc::SOL_SOCKET
        && (name == libc::SO_RCVTIMEO || name == libc::SO_SNDTIMEO)
        && !value.is_null()
        && len as usize >= size_of::<libc::timeval>()
        && let Some(ctx) = FdManager::global().get(fd, false)
    {
        let tv = unsafe { *(value as *const libc::timeval) };
        let ms = to_millis(tv.tv_sec, tv.tv_usec.max(0) as u64 / 1000);
        let event = if name == libc::SO_RCVTIMEO {
            Event::Read
        } else {
            Event::Write
        };
        ctx.set_timeout(event, (ms != 0).then_some(ms));
    }
    unsafe { (real().setsockopt)(fd, level, name, value, len) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_millis_converts_seconds() {
        assert_eq!(to_millis(2, 500), 2_500);
        assert_eq!(to_millis(0, 7), 7);
    }

    #[test]
    fn to_millis_clamps_out_of_range_values() {
        assert_eq!(to_millis(-5, 3), 3);
        assert_eq!(to_millis(libc::time_t::MAX, 999), u64::MAX);
        assert_eq!(to_millis(libc::time_t::MAX / 10, 0), u64::MAX);
    }
}
