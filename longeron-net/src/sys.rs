//! Thin epoll and self-pipe wrappers.
//!
//! # Safety
//!
//! The unsafe in this module is confined to the raw syscall surface:
//! `epoll_*`, `pipe2`, and the one-byte reads/writes on the interrupt pipe
//! take raw pointers and fds. Every call checks its return value and turns
//! failures into `io::Error`; fds returned by the kernel are wrapped in
//! `OwnedFd` immediately so they cannot leak.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Readiness bits treated as readable. Errors and hangups are folded into
/// both directions so whichever operation is pending observes them.
pub(crate) const READABLE: u32 =
    (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLERR | libc::EPOLLHUP) as u32;

/// Readiness bits treated as writable (connect completion included).
pub(crate) const WRITABLE: u32 = (libc::EPOLLOUT | libc::EPOLLERR | libc::EPOLLHUP) as u32;

pub(crate) const INTEREST_READ: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
pub(crate) const INTEREST_WRITE: u32 = libc::EPOLLOUT as u32;
pub(crate) const EDGE: u32 = libc::EPOLLET as u32;

/// Edge-triggered epoll instance.
pub(crate) struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 returns a fresh fd on success.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the fd was just created and is owned by no one else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(crate) fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    /// Replace the registered mask. Under edge triggering this also re-arms
    /// the fd: readiness that is currently high is reported as a new edge.
    pub(crate) fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: DEL ignores the event argument.
        let rc = unsafe {
            libc::epoll_ctl(
                self.fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // SAFETY: `event` outlives the call; the kernel copies it.
        let rc = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until at least one registered fd is ready; fills `events`.
    pub(crate) fn wait(&self, events: &mut Vec<libc::epoll_event>) -> io::Result<usize> {
        events.clear();
        // SAFETY: the pointer/capacity pair describes `events`' allocation;
        // epoll_wait writes at most `capacity` entries and we set the
        // length to exactly what it reported.
        let n = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                events.as_mut_ptr(),
                events.capacity() as libc::c_int,
                -1,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the kernel initialized the first `n` entries.
        unsafe { events.set_len(n as usize) };
        Ok(n as usize)
    }
}

/// Wakeup channel for the reactor, backed by a unix pipe.
///
/// The payload is meaningless; a single byte suffices, and a full pipe
/// already has a wakeup pending.
pub(crate) struct SelfPipe {
    reader: OwnedFd,
    writer: OwnedFd,
}

impl SelfPipe {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: pipe2 fills both fds on success.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both fds were just created and are owned by no one else.
        Ok(Self {
            reader: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            writer: unsafe { OwnedFd::from_raw_fd(fds[1]) },
        })
    }

    pub(crate) fn reader(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        let byte = [1u8];
        // SAFETY: writes one byte from a live stack buffer.
        let rc = unsafe { libc::write(self.writer.as_raw_fd(), byte.as_ptr().cast(), 1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Empty the pipe so the next wake produces a fresh readiness edge.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: reads into a live stack buffer of the stated length.
            let rc = unsafe {
                libc::read(self.reader.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if rc <= 0 {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_pipe_wakes_epoll() {
        let epoll = Epoll::new().unwrap();
        let pipe = SelfPipe::new().unwrap();
        epoll.add(pipe.reader(), libc::EPOLLIN as u32).unwrap();
        pipe.wake().unwrap();
        let mut events = Vec::with_capacity(8);
        let n = epoll.wait(&mut events).unwrap();
        assert_eq!(n, 1);
        let event_u64 = events[0].u64;
        assert_eq!(event_u64, pipe.reader() as u64);
        pipe.drain();
    }
}
