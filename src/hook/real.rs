//! The un-hooked libc functions.
//!
//! Each symbol is looked up once with `dlsym(RTLD_NEXT, ..)`, which skips
//! this crate's own exports when the `interpose` feature is on. If a lookup
//! fails, the direct `libc` binding is kept instead.

use libc::{
    c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec,
    useconds_t,
};
use std::ffi::CStr;
use std::sync::OnceLock;

pub(crate) type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
pub(crate) type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
pub(crate) type ReadvFn = unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
pub(crate) type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
pub(crate) type RecvfromFn =
    unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int, *mut sockaddr, *mut socklen_t) -> ssize_t;
pub(crate) type RecvmsgFn = unsafe extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t;
pub(crate) type SendFn = unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
pub(crate) type SendtoFn =
    unsafe extern "C" fn(c_int, *const c_void, size_t, c_int, *const sockaddr, socklen_t) -> ssize_t;
pub(crate) type SendmsgFn = unsafe extern "C" fn(c_int, *const msghdr, c_int) -> ssize_t;
pub(crate) type AcceptFn = unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int;
pub(crate) type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
pub(crate) type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
pub(crate) type SocketFn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
pub(crate) type SleepFn = unsafe extern "C" fn(c_uint) -> c_uint;
pub(crate) type UsleepFn = unsafe extern "C" fn(useconds_t) -> c_int;
pub(crate) type NanosleepFn = unsafe extern "C" fn(*const timespec, *mut timespec) -> c_int;
pub(crate) type FcntlFn = unsafe extern "C" fn(c_int, c_int, ...) -> c_int;
pub(crate) type IoctlFn = unsafe extern "C" fn(c_int, c_ulong, ...) -> c_int;
pub(crate) type GetsockoptFn =
    unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int;
pub(crate) type SetsockoptFn =
    unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int;

/// Table of the original functions.
pub(crate) struct Real {
    pub(crate) read: ReadFn,
    pub(crate) write: WriteFn,
    pub(crate) readv: ReadvFn,
    pub(crate) writev: ReadvFn,
    pub(crate) recv: RecvFn,
    pub(crate) recvfrom: RecvfromFn,
    pub(crate) recvmsg: RecvmsgFn,
    pub(crate) send: SendFn,
    pub(crate) sendto: SendtoFn,
    pub(crate) sendmsg: SendmsgFn,
    pub(crate) accept: AcceptFn,
    pub(crate) connect: ConnectFn,
    pub(crate) close: CloseFn,
    pub(crate) socket: SocketFn,
    pub(crate) sleep: SleepFn,
    pub(crate) usleep: UsleepFn,
    pub(crate) nanosleep: NanosleepFn,
    pub(crate) fcntl: FcntlFn,
    pub(crate) ioctl: IoctlFn,
    pub(crate) getsockopt: GetsockoptFn,
    pub(crate) setsockopt: SetsockoptFn,
}

static REAL: OnceLock<Real> = OnceLock::new();

/// Returns the table, resolving it on first use.
pub(crate) fn real() -> &'static Real {
    REAL.get_or_init(|| Real {
        read: resolve::<ReadFn>(c"read", libc::read),
        write: resolve::<WriteFn>(c"write", libc::write),
        readv: resolve::<ReadvFn>(c"readv", libc::readv),
        writev: resolve::<ReadvFn>(c"writev", libc::writev),
        recv: resolve::<RecvFn>(c"recv", libc::recv),
        recvfrom: resolve::<RecvfromFn>(c"recvfrom", libc::recvfrom),
        recvmsg: resolve::<RecvmsgFn>(c"recvmsg", libc::recvmsg),
        send: resolve::<SendFn>(c"send", libc::send),
        sendto: resolve::<SendtoFn>(c"sendto", libc::sendto),
        sendmsg: resolve::<SendmsgFn>(c"sendmsg", libc::sendmsg),
        accept: resolve::<AcceptFn>(c"accept", libc::accept),
        connect: resolve::<ConnectFn>(c"connect", libc::connect),
        close: resolve::<CloseFn>(c"close", libc::close),
        socket: resolve::<SocketFn>(c"socket", libc::socket),
        sleep: resolve::<SleepFn>(c"sleep", libc::sleep),
        usleep: resolve::<UsleepFn>(c"usleep", libc::usleep),
        nanosleep: resolve::<NanosleepFn>(c"nanosleep", libc::nanosleep),
        fcntl: resolve::<FcntlFn>(c"fcntl", libc::fcntl),
        ioctl: resolve::<IoctlFn>(c"ioctl", libc::ioctl),
        getsockopt: resolve::<GetsockoptFn>(c"getsockopt", libc::getsockopt),
        setsockopt: resolve::<SetsockoptFn>(c"setsockopt", libc::setsockopt),
    })
}

/// Looks `name` up past this object, falling back to `fallback`.
///
/// `F` is always one of the function pointer aliases above, which have the
/// size of a data pointer on every supported target.
fn resolve<F: Copy>(name: &CStr, fallback: F) -> F {
    debug_assert_eq!(size_of::<F>(), size_of::<*mut c_void>());

    let symbol = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if symbol.is_null() {
        log::warn!("dlsym({name:?}) failed, calling the libc binding directly");
        return fallback;
    }

    unsafe { std::mem::transmute_copy::<*mut c_void, F>(&symbol) }
}
