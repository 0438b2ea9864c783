//! Fiber stack allocation.
//!
//! Stacks are anonymous private mappings with one `PROT_NONE` guard page at
//! the low end, so running off the bottom of a fiber stack faults instead of
//! silently overwriting the neighbouring allocation.

use crate::error::{Error, Result};

use std::io;
use std::ptr;

/// An owned, guard-page protected stack region.
pub(crate) struct Stack {
    base: *mut libc::c_void,
    mapped: usize,
    page: usize,
}

// The mapping is plain memory owned by exactly one fiber.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Maps a stack with at least `size` usable bytes.
    pub(crate) fn new(size: usize) -> Result<Self> {
        let page = page_size();
        let usable = size.max(page).div_ceil(page) * page;
        let mapped = usable + page;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Stack {
                size,
                source: io::Error::last_os_error(),
            });
        }

        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            let source = io::Error::last_os_error();
            unsafe { libc::munmap(base, mapped) };
            return Err(Error::Stack { size, source });
        }

        Ok(Self { base, mapped, page })
    }

    /// Lowest usable address (just above the guard page).
    pub(crate) fn bottom(&self) -> *mut libc::c_void {
        unsafe { (self.base as *mut u8).add(self.page) as *mut libc::c_void }
    }

    /// Number of usable bytes.
    pub(crate) fn size(&self) -> usize {
        self.mapped - self.page
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.mapped);
        }
    }
}

fn page_size() -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 { 4096 } else { page as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_whole_pages() {
        let stack = Stack::new(1000).unwrap();
        assert_eq!(stack.size() % page_size(), 0);
        assert!(stack.size() >= 1000);
    }

    #[test]
    fn usable_region_is_writable() {
        let stack = Stack::new(64 * 1024).unwrap();
        let bytes = stack.bottom() as *mut u8;
        unsafe {
            bytes.write(0xAB);
            bytes.add(stack.size() - 1).write(0xCD);
            assert_eq!(bytes.read(), 0xAB);
            assert_eq!(bytes.add(stack.size() - 1).read(), 0xCD);
        }
    }
}
