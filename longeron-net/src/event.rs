//! Typed I/O events.
//!
//! One event is one pending socket operation. The reactor queues events per
//! fd and kind; when a readiness edge arrives, the head event's
//! [`perform`](IoEvent::perform) is posted to the executor, where it does
//! the nonblocking syscall work and either invokes its completion exactly
//! once or asks to be re-armed for the next edge. Buffers travel through
//! the event and come back in the completion together with the result.
//!
//! # Safety
//!
//! Events hold a raw fd, not an owned socket; syscalls borrow it as a
//! `socket2::Socket` for the duration of one `perform` and then forget the
//! wrapper so the owner keeps the fd. The owner's shutdown cancels queued
//! events before the fd closes.

#![allow(unsafe_code)]

use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, RawFd};

use longeron_core::buffer::SequenceBuffer;
use longeron_core::executor::WorkGuard;

/// Readiness kind an event waits for. Connect completion is write
/// readiness.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKind {
    Read = 0,
    Write = 1,
}

pub(crate) const KIND_COUNT: usize = 2;

/// Completion for buffer-carrying operations.
pub type IoCallback = Box<dyn FnOnce(io::Result<usize>, SequenceBuffer) + Send + 'static>;

/// Completion for connect.
pub type ConnectCallback = Box<dyn FnOnce(io::Result<()>) + Send + 'static>;

/// Boundary predicate for `async_recv_until`: the number of readable bytes
/// forming a complete unit, or `None` while more input is needed.
pub type CompletionCondition = Box<dyn FnMut(&SequenceBuffer) -> Option<usize> + Send + 'static>;

pub(crate) fn canceled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "operation canceled")
}

/// What `perform` did with the event.
pub(crate) enum Performed {
    /// Completion invoked; the event is spent.
    Complete,
    /// Not finished; queue it again for the next readiness edge.
    Rearm(Box<dyn IoEvent>),
}

pub(crate) trait IoEvent: Send {
    fn kind(&self) -> EventKind;
    fn perform(self: Box<Self>) -> Performed;
    /// Complete with a canceled error without touching the fd.
    fn cancel(self: Box<Self>);
}

/// Borrow `fd` as a `socket2::Socket` for one syscall batch. The wrapper is
/// forgotten afterwards so the fd's owner keeps it open.
fn with_socket<T>(fd: RawFd, f: impl FnOnce(&socket2::Socket) -> T) -> T {
    // SAFETY: the fd stays open for the duration of the call; events on a
    // closing fd are canceled (never performed) by the reactor.
    let socket = unsafe { socket2::Socket::from_raw_fd(fd) };
    let out = f(&socket);
    std::mem::forget(socket);
    out
}

/// One readable chunk into the buffer.
pub(crate) struct RecvEvent {
    fd: RawFd,
    buf: SequenceBuffer,
    callback: IoCallback,
    chunk: usize,
    _work: WorkGuard,
}

impl RecvEvent {
    pub(crate) fn new(
        fd: RawFd,
        buf: SequenceBuffer,
        callback: IoCallback,
        chunk: usize,
        work: WorkGuard,
    ) -> Self {
        Self {
            fd,
            buf,
            callback,
            chunk,
            _work: work,
        }
    }
}

impl IoEvent for RecvEvent {
    fn kind(&self) -> EventKind {
        EventKind::Read
    }

    fn perform(mut self: Box<Self>) -> Performed {
        self.buf.prepare(self.chunk);
        let result = with_socket(self.fd, |mut socket| socket.read(self.buf.write_head()));
        match result {
            Ok(0) => {
                (self.callback)(Err(io::ErrorKind::UnexpectedEof.into()), self.buf);
                Performed::Complete
            }
            Ok(n) => {
                self.buf.accept(n);
                (self.callback)(Ok(n), self.buf);
                Performed::Complete
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Performed::Rearm(self),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Performed::Rearm(self),
            Err(err) => {
                (self.callback)(Err(err), self.buf);
                Performed::Complete
            }
        }
    }

    fn cancel(self: Box<Self>) {
        (self.callback)(Err(canceled()), self.buf);
    }
}

/// Read until the completion condition reports a boundary.
pub(crate) struct RecvUntilEvent {
    fd: RawFd,
    buf: SequenceBuffer,
    callback: IoCallback,
    condition: CompletionCondition,
    chunk: usize,
    _work: WorkGuard,
}

impl RecvUntilEvent {
    pub(crate) fn new(
        fd: RawFd,
        buf: SequenceBuffer,
        callback: IoCallback,
        condition: CompletionCondition,
        chunk: usize,
        work: WorkGuard,
    ) -> Self {
        Self {
            fd,
            buf,
            callback,
            condition,
            chunk,
            _work: work,
        }
    }
}

impl IoEvent for RecvUntilEvent {
    fn kind(&self) -> EventKind {
        EventKind::Read
    }

    fn perform(mut self: Box<Self>) -> Performed {
        loop {
            self.buf.prepare(self.chunk);
            let result = with_socket(self.fd, |mut socket| socket.read(self.buf.write_head()));
            match result {
                Ok(0) => {
                    (self.callback)(Err(io::ErrorKind::UnexpectedEof.into()), self.buf);
                    return Performed::Complete;
                }
                Ok(n) => {
                    self.buf.accept(n);
                    if let Some(boundary) = (self.condition)(&self.buf) {
                        (self.callback)(Ok(boundary), self.buf);
                        return Performed::Complete;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Performed::Rearm(self);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    (self.callback)(Err(err), self.buf);
                    return Performed::Complete;
                }
            }
        }
    }

    fn cancel(self: Box<Self>) {
        (self.callback)(Err(canceled()), self.buf);
    }
}

/// Flush the readable region of the buffer; loops on partial writes within
/// one dispatch and re-arms across `WouldBlock`.
pub(crate) struct SendEvent {
    fd: RawFd,
    buf: SequenceBuffer,
    callback: IoCallback,
    sent: usize,
    _work: WorkGuard,
}

impl SendEvent {
    pub(crate) fn new(fd: RawFd, buf: SequenceBuffer, callback: IoCallback, work: WorkGuard) -> Self {
        Self {
            fd,
            buf,
            callback,
            sent: 0,
            _work: work,
        }
    }
}

impl IoEvent for SendEvent {
    fn kind(&self) -> EventKind {
        EventKind::Write
    }

    fn perform(mut self: Box<Self>) -> Performed {
        while self.buf.read_size() > 0 {
            let result = with_socket(self.fd, |mut socket| socket.write(self.buf.read_head()));
            match result {
                Ok(n) => {
                    self.buf.consume(n);
                    self.sent += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Performed::Rearm(self);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    // Partial failure: the consumed cursor records how much
                    // made it out before the error.
                    (self.callback)(Err(err), self.buf);
                    return Performed::Complete;
                }
            }
        }
        (self.callback)(Ok(self.sent), self.buf);
        Performed::Complete
    }

    fn cancel(self: Box<Self>) {
        (self.callback)(Err(canceled()), self.buf);
    }
}

/// Nonblocking connect completion: write readiness plus an `SO_ERROR`
/// check.
pub(crate) struct ConnectEvent {
    fd: RawFd,
    callback: ConnectCallback,
    _work: WorkGuard,
}

impl ConnectEvent {
    pub(crate) fn new(fd: RawFd, callback: ConnectCallback, work: WorkGuard) -> Self {
        Self {
            fd,
            callback,
            _work: work,
        }
    }
}

impl IoEvent for ConnectEvent {
    fn kind(&self) -> EventKind {
        EventKind::Write
    }

    fn perform(self: Box<Self>) -> Performed {
        let result = match with_socket(self.fd, socket2::Socket::take_error) {
            Ok(None) => Ok(()),
            Ok(Some(err)) | Err(err) => Err(err),
        };
        (self.callback)(result);
        Performed::Complete
    }

    fn cancel(self: Box<Self>) {
        (self.callback)(Err(canceled()));
    }
}
