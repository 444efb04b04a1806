//! Non-blocking TCP stream socket with callback-driven async operations.
//!
//! A [`TcpSocket`] wraps one non-blocking stream fd. Every async operation
//! installs one typed event into the socket's fd record with the reactor;
//! the completion runs on the socket's executor. Buffers are passed in by
//! value and handed back through the completion together with the result.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::trace;

use longeron_core::buffer::SequenceBuffer;
use longeron_core::executor::Executor;

use crate::event::{ConnectEvent, IoEvent, RecvEvent, RecvUntilEvent, SendEvent};
use crate::reactor::{FdRecord, Reactor};

/// Bytes reserved ahead of each read syscall.
pub(crate) const DEFAULT_RECV_CHUNK: usize = 512;

struct Stream {
    socket: Socket,
    record: Arc<FdRecord>,
}

/// Non-blocking TCP stream socket.
pub struct TcpSocket {
    executor: Executor,
    recv_chunk: usize,
    stream: Mutex<Option<Stream>>,
}

impl TcpSocket {
    #[must_use]
    pub fn new(executor: &Executor) -> Self {
        Self::with_recv_chunk(executor, DEFAULT_RECV_CHUNK)
    }

    #[must_use]
    pub fn with_recv_chunk(executor: &Executor, recv_chunk: usize) -> Self {
        Self {
            executor: executor.clone(),
            recv_chunk,
            stream: Mutex::new(None),
        }
    }

    /// Adopt an already-connected stream (typically an accepted
    /// connection), replacing any current one.
    pub fn assign(&self, socket: Socket) -> io::Result<()> {
        self.shutdown();
        socket.set_nonblocking(true)?;
        let record = FdRecord::new(socket.as_raw_fd(), self.executor.clone());
        Reactor::global().register_fd(Arc::clone(&record))?;
        *self.stream.lock() = Some(Stream { socket, record });
        Ok(())
    }

    /// Begin a non-blocking connect to `addr`; `callback` receives the
    /// outcome once write readiness reports it.
    ///
    /// Replaces any current stream.
    pub fn async_connect(
        &self,
        addr: SocketAddr,
        callback: impl FnOnce(io::Result<()>) + Send + 'static,
    ) {
        match self.begin_connect(addr) {
            Ok((record, false)) => {
                let event = ConnectEvent::new(record.fd, Box::new(callback), self.executor.work());
                Reactor::global().start_event(Box::new(event), &record);
            }
            Ok((_, true)) => self.executor.post(move || callback(Ok(()))),
            Err(err) => self.executor.post(move || callback(Err(err))),
        }
    }

    /// Create the socket, start the connect, register the fd. The boolean
    /// is true when the connect completed synchronously.
    fn begin_connect(&self, addr: SocketAddr) -> io::Result<(Arc<FdRecord>, bool)> {
        self.shutdown();
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        let connected = match socket.connect(&addr.into()) {
            Ok(()) => true,
            Err(err)
                if err.raw_os_error() == Some(libc::EINPROGRESS)
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                false
            }
            Err(err) => return Err(err),
        };
        trace!(%addr, connected, "tcp: connect started");
        let record = FdRecord::new(socket.as_raw_fd(), self.executor.clone());
        Reactor::global().register_fd(Arc::clone(&record))?;
        *self.stream.lock() = Some(Stream { socket, record: Arc::clone(&record) });
        Ok((record, connected))
    }

    /// Receive one readable chunk into `buf`; completes with the byte count
    /// or an error, handing `buf` back either way.
    pub fn async_recv(
        &self,
        buf: SequenceBuffer,
        callback: impl FnOnce(io::Result<usize>, SequenceBuffer) + Send + 'static,
    ) {
        match self.current_record() {
            Some(record) => {
                let event = RecvEvent::new(
                    record.fd,
                    buf,
                    Box::new(callback),
                    self.recv_chunk,
                    self.executor.work(),
                );
                Reactor::global().start_event(Box::new(event), &record);
            }
            None => self.fail_unassigned(buf, callback),
        }
    }

    /// Receive until `condition` reports a boundary; completes with the
    /// boundary length. If the boundary is already buffered, completes
    /// without touching the fd.
    pub fn async_recv_until(
        &self,
        buf: SequenceBuffer,
        callback: impl FnOnce(io::Result<usize>, SequenceBuffer) + Send + 'static,
        mut condition: impl FnMut(&SequenceBuffer) -> Option<usize> + Send + 'static,
    ) {
        if let Some(boundary) = condition(&buf) {
            self.executor.post(move || callback(Ok(boundary), buf));
            return;
        }
        match self.current_record() {
            Some(record) => {
                let event = RecvUntilEvent::new(
                    record.fd,
                    buf,
                    Box::new(callback),
                    Box::new(condition),
                    self.recv_chunk,
                    self.executor.work(),
                );
                Reactor::global().start_event(Box::new(event), &record);
            }
            None => self.fail_unassigned(buf, callback),
        }
    }

    /// Send the readable region of `buf`; completes once the budget is
    /// exhausted or on error (with the consumed cursor recording partial
    /// progress).
    pub fn async_send(
        &self,
        buf: SequenceBuffer,
        callback: impl FnOnce(io::Result<usize>, SequenceBuffer) + Send + 'static,
    ) {
        match self.current_record() {
            Some(record) => {
                let event = SendEvent::new(record.fd, buf, Box::new(callback), self.executor.work());
                Reactor::global().start_event(Box::new(event), &record);
            }
            None => self.fail_unassigned(buf, callback),
        }
    }

    /// Tear down the stream: cancel queued events, deregister the fd, close
    /// it. Idempotent.
    pub fn shutdown(&self) {
        let Some(stream) = self.stream.lock().take() else {
            return;
        };
        Reactor::global().deregister_fd(stream.record.fd);
        let _ = stream.socket.shutdown(std::net::Shutdown::Both);
        trace!(fd = stream.record.fd, "tcp: socket shut down");
        // Dropping the socket closes the fd.
    }

    /// The current fd, if a stream is assigned.
    #[must_use]
    pub fn fd(&self) -> Option<RawFd> {
        self.stream.lock().as_ref().map(|s| s.record.fd)
    }

    fn current_record(&self) -> Option<Arc<FdRecord>> {
        self.stream.lock().as_ref().map(|s| Arc::clone(&s.record))
    }

    fn fail_unassigned(
        &self,
        buf: SequenceBuffer,
        callback: impl FnOnce(io::Result<usize>, SequenceBuffer) + Send + 'static,
    ) {
        self.executor
            .post(move || callback(Err(io::ErrorKind::NotConnected.into()), buf));
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}
