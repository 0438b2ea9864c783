use crate::error::{Error, Result};

use libc::{EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, F_GETFL, F_SETFL, O_NONBLOCK};
use std::io;
use std::os::unix::io::RawFd;

/// Readiness direction a fiber or callback can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    pub(crate) const NONE: u32 = 0;
    pub(crate) const READ: u32 = libc::EPOLLIN as u32;
    pub(crate) const WRITE: u32 = libc::EPOLLOUT as u32;

    /// The epoll interest bit for this direction.
    pub(crate) fn mask(self) -> u32 {
        match self {
            Event::Read => Self::READ,
            Event::Write => Self::WRITE,
        }
    }
}

/// Owned epoll instance.
pub(crate) struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub(crate) fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::Epoll(io::Error::last_os_error()));
        }

        Ok(Self { epfd })
    }

    pub(crate) fn add(&self, fd: RawFd, events: u32) -> Result<()> {
        self.ctl(EPOLL_CTL_ADD, "ADD", fd, events)
    }

    pub(crate) fn modify(&self, fd: RawFd, events: u32) -> Result<()> {
        self.ctl(EPOLL_CTL_MOD, "MOD", fd, events)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> Result<()> {
        self.ctl(EPOLL_CTL_DEL, "DEL", fd, 0)
    }

    fn ctl(&self, op: libc::c_int, name: &'static str, fd: RawFd, events: u32) -> Result<()> {
        // The fd itself is the token, so a readiness event maps straight back
        // to its context slot.
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };

        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if ret < 0 {
            return Err(Error::EpollCtl {
                op: name,
                fd,
                source: io::Error::last_os_error(),
            });
        }

        Ok(())
    }

    /// Waits up to `timeout_ms` for events, retrying when interrupted by a
    /// signal.
    ///
    /// # Returns
    /// The number of entries filled in `events`.
    pub(crate) fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    timeout_ms,
                )
            };

            if n >= 0 {
                return Ok(n as usize);
            }

            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

/// Sets `O_NONBLOCK` on `fd`.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { libc::fcntl(fd, F_SETFL, flags | O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
