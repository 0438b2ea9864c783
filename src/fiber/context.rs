//! Saved execution contexts and the switch primitive.
//!
//! This is the only place that knows fibers are implemented with the
//! `ucontext` family. Everything above works with [`Context`] values and
//! [`switch`].

use super::stack::Stack;
use crate::error::{Error, Result};

use std::io;
use std::mem::MaybeUninit;

unsafe extern "C" {
    fn getcontext(ucp: *mut libc::ucontext_t) -> libc::c_int;
    fn makecontext(ucp: *mut libc::ucontext_t, func: extern "C" fn(), argc: libc::c_int, ...);
    fn swapcontext(oucp: *mut libc::ucontext_t, ucp: *const libc::ucontext_t) -> libc::c_int;
}

/// A saved register set. Boxed so its address stays stable while the owning
/// fiber moves between threads.
pub(crate) struct Context {
    raw: Box<libc::ucontext_t>,
}

impl Context {
    /// Captures the calling thread's context. Used for a thread's main fiber,
    /// which runs on the OS-provided stack.
    pub(crate) fn main() -> Result<Self> {
        let mut raw = Box::new(unsafe { MaybeUninit::<libc::ucontext_t>::zeroed().assume_init() });
        if unsafe { getcontext(&mut *raw) } != 0 {
            return Err(Error::Context(io::Error::last_os_error()));
        }

        Ok(Self { raw })
    }

    /// Prepares a context that starts executing `entry` on `stack`.
    pub(crate) fn with_entry(stack: &Stack, entry: extern "C" fn()) -> Result<Self> {
        let mut context = Self::main()?;
        context.prepare(stack, entry);

        Ok(context)
    }

    /// Re-targets an existing context at `entry`, reusing `stack`.
    pub(crate) fn rearm(&mut self, stack: &Stack, entry: extern "C" fn()) -> Result<()> {
        if unsafe { getcontext(&mut *self.raw) } != 0 {
            return Err(Error::Context(io::Error::last_os_error()));
        }
        self.prepare(stack, entry);

        Ok(())
    }

    fn prepare(&mut self, stack: &Stack, entry: extern "C" fn()) {
        self.raw.uc_link = std::ptr::null_mut();
        self.raw.uc_stack.ss_sp = stack.bottom();
        self.raw.uc_stack.ss_size = stack.size();
        self.raw.uc_stack.ss_flags = 0;

        unsafe { makecontext(&mut *self.raw, entry, 0) };
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::ucontext_t {
        &mut *self.raw
    }
}

/// Saves the running context into `from` and resumes `to`.
///
/// # Safety
/// Both pointers must reference live contexts, `to` must not be running on
/// any thread, and `from` must describe the caller.
pub(crate) unsafe fn switch(from: *mut libc::ucontext_t, to: *const libc::ucontext_t) {
    let ret = unsafe { swapcontext(from, to) };
    if ret != 0 {
        log::error!("swapcontext failed: {}", io::Error::last_os_error());
    }
}
