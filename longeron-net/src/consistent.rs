//! Self-healing, order-preserving session over a TCP stream.
//!
//! A [`ConsistentSocket`] layers reconnection, send coalescing, and
//! per-direction operation queues on top of one [`TcpSocket`]. Three
//! coroutine loops (connect, read, write) express the retry and queueing
//! logic as straight-line code; I/O completions park each loop at a yield
//! and wake it with the result.
//!
//! Locking discipline: the per-instance mutex guards the status bits,
//! queues, and result slots only. It is never held across a yield, and no
//! coroutine is ever resumed while it is held. Loop bodies wake each other
//! exclusively through tasks posted to the executor, so a body never blocks
//! on another loop's resumption.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};

use longeron_core::buffer::SequenceBuffer;
use longeron_core::coroutine::{Coroutine, Yielder};
use longeron_core::executor::Executor;
use longeron_core::timer::Timer;

use crate::message::Message;
use crate::options::{Backoff, SessionOptions};
use crate::tcp::TcpSocket;

/// Terminal results a session operation can observe.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// The session was shut down while the operation was pending.
    #[error("operation canceled by shutdown")]
    Canceled,
    /// The per-direction queue is at its high-water mark.
    #[error("session queue full")]
    BufferFull,
    /// The transport is dead and not recovering.
    #[error("session down")]
    Down,
    /// Reserved default.
    #[error("unknown session failure")]
    Unknown,
}

pub type SessionResult<T> = Result<T, SessionError>;

type RecvCallback = Box<dyn FnOnce(SessionResult<Message>) + Send + 'static>;
type SendCallback = Box<dyn FnOnce(SessionResult<()>) + Send + 'static>;

// Status bits. Only DOWN is terminal; the others overlap freely.
const CONNECTING: u32 = 1;
const READY: u32 = 2;
const WRITING: u32 = 4;
const READING: u32 = 8;
const DOWN: u32 = 16;

struct ReadOp {
    callback: RecvCallback,
}

struct WriteOp {
    message: Message,
    callback: SendCallback,
}

struct SessionState {
    status: u32,
    should_connect: bool,
    read_queue: VecDeque<ReadOp>,
    write_queue: VecDeque<WriteOp>,
    backoff: Backoff,
    /// Reconnect delay armed; the connect loop stays parked until the tick.
    reconnect_armed: bool,
    // Result slots filled by I/O completions before the owning loop is
    // resumed. A spuriously woken loop finds its slot empty and parks
    // again.
    connect_result: Option<io::Result<()>>,
    read_result: Option<io::Result<usize>>,
    write_result: Option<io::Result<usize>>,
    /// Receive buffer; survives across messages so a pipelined frame tail
    /// is not lost.
    read_buf: Option<SequenceBuffer>,
    /// Send-coalescing buffer; one flush per queued burst.
    send_buf: Option<SequenceBuffer>,
}

/// What a loop body decided after one step.
enum Step {
    /// More work is immediately available.
    Continue,
    /// Nothing to do until woken.
    Park,
    /// The session is terminal; unwind the loop.
    Exit,
}

/// Self-healing, order-preserving session over one [`TcpSocket`].
///
/// Held via `Arc`: completions captured into deferred I/O keep the instance
/// alive past the caller's frame. Tear down with
/// [`shutdown`](ConsistentSocket::shutdown).
pub struct ConsistentSocket {
    executor: Executor,
    socket: TcpSocket,
    remote: Option<SocketAddr>,
    options: SessionOptions,
    reconnect_timer: Timer,
    state: Mutex<SessionState>,
    connect_coro: Coroutine,
    read_coro: Coroutine,
    write_coro: Coroutine,
}

impl ConsistentSocket {
    /// Session over a not-yet-connected socket; pair with
    /// [`base_socket`](Self::base_socket) + [`set_ready`](Self::set_ready)
    /// to adopt an accepted stream.
    #[must_use]
    pub fn new(executor: &Executor) -> Arc<Self> {
        Self::build(executor, None, SessionOptions::default())
    }

    /// Session that dials (and re-dials) `remote`.
    #[must_use]
    pub fn connect_to(executor: &Executor, remote: SocketAddr) -> Arc<Self> {
        Self::build(executor, Some(remote), SessionOptions::default())
    }

    #[must_use]
    pub fn with_options(
        executor: &Executor,
        remote: SocketAddr,
        options: SessionOptions,
    ) -> Arc<Self> {
        Self::build(executor, Some(remote), options)
    }

    fn build(executor: &Executor, remote: Option<SocketAddr>, options: SessionOptions) -> Arc<Self> {
        let this = Arc::new(Self {
            executor: executor.clone(),
            socket: TcpSocket::with_recv_chunk(executor, options.read_chunk),
            remote,
            reconnect_timer: Timer::new(executor),
            state: Mutex::new(SessionState {
                status: 0,
                should_connect: false,
                read_queue: VecDeque::new(),
                write_queue: VecDeque::new(),
                backoff: Backoff::new(&options),
                reconnect_armed: false,
                connect_result: None,
                read_result: None,
                write_result: None,
                read_buf: Some(SequenceBuffer::new()),
                send_buf: Some(SequenceBuffer::new()),
            }),
            options,
            connect_coro: Coroutine::new(),
            read_coro: Coroutine::new(),
            write_coro: Coroutine::new(),
        });
        this.install_loops();
        this
    }

    /// Wire the three loop bodies. Parked loops hold only a weak reference,
    /// so abandoned sessions unwind instead of keeping themselves alive.
    fn install_loops(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.connect_coro.set_function(move |y| loop {
            let Some(this) = weak.upgrade() else { return };
            match this.connect_step(y) {
                Step::Exit => return,
                Step::Continue => drop(this),
                Step::Park => {
                    drop(this);
                    y.yield_now();
                }
            }
        });

        let weak = Arc::downgrade(self);
        self.read_coro.set_function(move |y| loop {
            let Some(this) = weak.upgrade() else { return };
            match this.read_step(y) {
                Step::Exit => return,
                Step::Continue => drop(this),
                Step::Park => {
                    drop(this);
                    y.yield_now();
                }
            }
        });

        let weak = Arc::downgrade(self);
        self.write_coro.set_function(move |y| loop {
            let Some(this) = weak.upgrade() else { return };
            match this.write_step(y) {
                Step::Exit => return,
                Step::Continue => drop(this),
                Step::Park => {
                    drop(this);
                    y.yield_now();
                }
            }
        });
    }

    /// Enqueue a receive; `callback` observes the next inbound message, or
    /// `BufferFull` at the high-water mark, or `Down`/`Canceled` when the
    /// session dies.
    pub fn async_recv(
        self: &Arc<Self>,
        callback: impl FnOnce(SessionResult<Message>) + Send + 'static,
    ) {
        let ready = {
            let mut state = self.state.lock();
            if state.status & DOWN != 0 {
                drop(state);
                callback(Err(SessionError::Down));
                return;
            }
            if state.read_queue.len() >= self.options.recv_hwm {
                drop(state);
                callback(Err(SessionError::BufferFull));
                return;
            }
            state.read_queue.push_back(ReadOp {
                callback: Box::new(callback),
            });
            state.status & READY != 0
        };
        if ready {
            self.nudge(&self.read_coro, READING);
        }
    }

    /// Enqueue a send of `message`; `callback` observes the flush outcome.
    pub fn async_send(
        self: &Arc<Self>,
        message: Message,
        callback: impl FnOnce(SessionResult<()>) + Send + 'static,
    ) {
        let ready = {
            let mut state = self.state.lock();
            if state.status & DOWN != 0 {
                drop(state);
                callback(Err(SessionError::Down));
                return;
            }
            if state.write_queue.len() >= self.options.send_hwm {
                drop(state);
                callback(Err(SessionError::BufferFull));
                return;
            }
            state.write_queue.push_back(WriteOp {
                message,
                callback: Box::new(callback),
            });
            state.status & READY != 0
        };
        if ready {
            self.nudge(&self.write_coro, WRITING);
        }
    }

    /// Start dialing the remote; keeps re-dialing with backoff until the
    /// session is shut down.
    pub fn start_connecting(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.status & DOWN != 0 {
                return;
            }
            state.should_connect = true;
            if state.status & (CONNECTING | READY) != 0 {
                return;
            }
        }
        self.post_resume(&self.connect_coro);
    }

    /// Mark an adopted (accepted) stream usable and wake both directions.
    pub fn set_ready(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.status & DOWN != 0 {
                return;
            }
            state.status |= READY;
        }
        self.nudge(&self.read_coro, READING);
        self.nudge(&self.write_coro, WRITING);
    }

    /// The underlying stream socket, for adopting an accepted connection.
    pub fn base_socket(&self) -> &TcpSocket {
        &self.socket
    }

    /// Terminal teardown: completes every queued operation with `Canceled`
    /// before returning, cancels in-flight I/O, and unwinds the loops.
    pub fn shutdown(self: &Arc<Self>) {
        let (reads, writes) = {
            let mut state = self.state.lock();
            if state.status & DOWN != 0 {
                return;
            }
            state.status |= DOWN;
            state.should_connect = false;
            (
                state.read_queue.drain(..).collect::<Vec<_>>(),
                state.write_queue.drain(..).collect::<Vec<_>>(),
            )
        };
        debug!(
            canceled_reads = reads.len(),
            canceled_writes = writes.len(),
            "session: shutdown"
        );
        self.reconnect_timer.cancel();
        self.socket.shutdown();
        for op in reads {
            (op.callback)(Err(SessionError::Canceled));
        }
        for op in writes {
            (op.callback)(Err(SessionError::Canceled));
        }
        // Wake the loops so they observe DOWN and finish.
        self.post_resume(&self.connect_coro);
        self.post_resume(&self.read_coro);
        self.post_resume(&self.write_coro);
    }

    // ---- connect loop ----

    fn connect_step(self: &Arc<Self>, y: &Yielder) -> Step {
        {
            let mut state = self.state.lock();
            if state.status & DOWN != 0 {
                return Step::Exit;
            }
            if state.reconnect_armed
                || !state.should_connect
                || state.status & READY != 0
            {
                return Step::Park;
            }
            state.status |= CONNECTING;
            state.status &= !READY;
        }
        let Some(remote) = self.remote else {
            // Adopted-stream sessions have nowhere to dial.
            let mut state = self.state.lock();
            state.status &= !CONNECTING;
            state.should_connect = false;
            return Step::Park;
        };
        debug!(%remote, "session: connecting");
        let this = Arc::clone(self);
        self.socket
            .async_connect(remote, move |result| this.on_connect_done(result));
        let Some(result) = self.await_slot(y, |state| state.connect_result.take()) else {
            return Step::Exit;
        };
        match result {
            Ok(()) => {
                {
                    let mut state = self.state.lock();
                    state.status &= !CONNECTING;
                    if state.status & DOWN != 0 {
                        return Step::Exit;
                    }
                    state.status |= READY;
                    state.backoff.reset();
                    // A dead connection may have left a partial frame
                    // behind.
                    state.read_buf = Some(SequenceBuffer::new());
                }
                debug!(%remote, "session: connected");
                self.nudge(&self.read_coro, READING);
                self.nudge(&self.write_coro, WRITING);
                Step::Park
            }
            Err(err) => {
                let delay = {
                    let mut state = self.state.lock();
                    state.status &= !CONNECTING;
                    if state.status & DOWN != 0 {
                        return Step::Exit;
                    }
                    state.reconnect_armed = true;
                    state.backoff.advance()
                };
                debug!(error = %err, ?delay, "session: connect failed, backing off");
                let this = Arc::clone(self);
                self.reconnect_timer.expires_from_now(delay);
                self.reconnect_timer
                    .async_wait(move |_| this.on_reconnect_tick());
                Step::Park
            }
        }
    }

    fn on_connect_done(self: Arc<Self>, result: io::Result<()>) {
        self.state.lock().connect_result = Some(result);
        self.post_resume(&self.connect_coro);
    }

    fn on_reconnect_tick(self: Arc<Self>) {
        self.state.lock().reconnect_armed = false;
        self.post_resume(&self.connect_coro);
    }

    // ---- read loop ----

    fn read_step(self: &Arc<Self>, y: &Yielder) -> Step {
        let buf = {
            let mut state = self.state.lock();
            if state.status & DOWN != 0 {
                return Step::Exit;
            }
            if state.read_queue.is_empty() || state.status & READY == 0 {
                return Step::Park;
            }
            state.status |= READING;
            state.read_buf.take().unwrap_or_default()
        };
        let this = Arc::clone(self);
        self.socket.async_recv_until(
            buf,
            move |result, buf| this.on_read_done(result, buf),
            Message::read_boundary,
        );
        let Some(result) = self.await_slot(y, |state| state.read_result.take()) else {
            // Shut down mid-receive; the queue was already drained.
            return Step::Exit;
        };
        match result {
            Ok(_boundary) => {
                let (op, message) = {
                    let mut state = self.state.lock();
                    state.status &= !READING;
                    if state.status & DOWN != 0 {
                        return Step::Exit;
                    }
                    let Some(op) = state.read_queue.pop_front() else {
                        return Step::Continue;
                    };
                    let mut buf = state.read_buf.take().unwrap_or_default();
                    let message = Message::decode_from(&mut buf);
                    if buf.is_empty() {
                        buf.reset();
                    }
                    state.read_buf = Some(buf);
                    (op, message)
                };
                match message {
                    Some(message) => {
                        trace!(len = message.len(), "session: message received");
                        (op.callback)(Ok(message));
                    }
                    // The boundary promised a frame; not finding one is a
                    // framing bug, not a transport state.
                    None => (op.callback)(Err(SessionError::Unknown)),
                }
                Step::Continue
            }
            Err(err) => {
                warn!(error = %err, "session: read failed");
                let failed = {
                    let mut state = self.state.lock();
                    state.status &= !(READING | READY);
                    if state.status & DOWN != 0 {
                        return Step::Exit;
                    }
                    state.read_buf = Some(SequenceBuffer::new());
                    state.read_queue.drain(..).collect::<Vec<_>>()
                };
                for op in failed {
                    (op.callback)(Err(SessionError::Down));
                }
                self.do_reconnect();
                Step::Continue
            }
        }
    }

    fn on_read_done(self: Arc<Self>, result: io::Result<usize>, buf: SequenceBuffer) {
        {
            let mut state = self.state.lock();
            state.read_buf = Some(buf);
            state.read_result = Some(result);
        }
        self.post_resume(&self.read_coro);
    }

    // ---- write loop ----

    fn write_step(self: &Arc<Self>, y: &Yielder) -> Step {
        let (buf, batch_len) = {
            let mut state = self.state.lock();
            if state.status & DOWN != 0 {
                return Step::Exit;
            }
            if state.write_queue.is_empty() || state.status & READY == 0 {
                return Step::Park;
            }
            state.status |= WRITING;
            // Coalesce the whole queued burst into one flush. The ops stay
            // queued until the flush completes, so shutdown still owns
            // their cancellation.
            let mut buf = state.send_buf.take().unwrap_or_default();
            buf.reset();
            for op in &state.write_queue {
                op.message.encode_into(&mut buf);
            }
            (buf, state.write_queue.len())
        };
        trace!(batch = batch_len, bytes = buf.read_size(), "session: flushing");
        let this = Arc::clone(self);
        self.socket
            .async_send(buf, move |result, buf| this.on_write_done(result, buf));
        let Some(result) = self.await_slot(y, |state| state.write_result.take()) else {
            return Step::Exit;
        };
        match result {
            Ok(_sent) => {
                let batch = {
                    let mut state = self.state.lock();
                    state.status &= !WRITING;
                    if state.status & DOWN != 0 {
                        return Step::Exit;
                    }
                    let drain_len = batch_len.min(state.write_queue.len());
                    state
                        .write_queue
                        .drain(..drain_len)
                        .collect::<Vec<_>>()
                };
                for op in batch {
                    (op.callback)(Ok(()));
                }
                Step::Continue
            }
            Err(err) => {
                warn!(error = %err, "session: write failed");
                {
                    let mut state = self.state.lock();
                    state.status &= !(WRITING | READY);
                    if state.status & DOWN != 0 {
                        return Step::Exit;
                    }
                    // The batch stays queued; it is re-encoded and
                    // re-flushed once the transport recovers.
                }
                self.do_reconnect();
                Step::Continue
            }
        }
    }

    fn on_write_done(self: Arc<Self>, result: io::Result<usize>, buf: SequenceBuffer) {
        {
            let mut state = self.state.lock();
            state.send_buf = Some(buf);
            state.write_result = Some(result);
        }
        self.post_resume(&self.write_coro);
    }

    // ---- shared plumbing ----

    /// Park at the yield until `take` produces a completion result.
    /// `None` means the session went DOWN while waiting.
    fn await_slot<T>(
        &self,
        y: &Yielder,
        mut take: impl FnMut(&mut SessionState) -> Option<T>,
    ) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(result) = take(&mut state) {
                    return Some(result);
                }
                if state.status & DOWN != 0 {
                    return None;
                }
            }
            y.yield_now();
        }
    }

    /// Transport died outside the connect loop: drop READY and wake the
    /// dialer unless one is already in flight.
    fn do_reconnect(self: &Arc<Self>) {
        let resume = {
            let mut state = self.state.lock();
            state.status &= !READY;
            state.should_connect && state.status & CONNECTING == 0
        };
        if resume {
            debug!("session: scheduling reconnect");
            self.post_resume(&self.connect_coro);
        }
    }

    /// Wake a loop parked for new work; skipped while it is mid-operation
    /// (`busy_bit` set) since its completion will wake it instead.
    fn nudge(self: &Arc<Self>, coro: &Coroutine, busy_bit: u32) {
        {
            let state = self.state.lock();
            if state.status & (busy_bit | DOWN) != 0 {
                return;
            }
        }
        self.post_resume(coro);
    }

    /// Resume through the executor. Completions and user callbacks can run
    /// inline on a loop body's own stack; a posted resume can never
    /// deadlock on that body's handoff, and spurious wakes are absorbed by
    /// the state recheck.
    fn post_resume(self: &Arc<Self>, coro: &Coroutine) {
        let coro = coro.clone();
        let this = Arc::clone(self);
        self.executor.post(move || {
            let _keepalive = this;
            if let Err(err) = coro.resume() {
                warn!(error = %err, "session: loop body panicked");
            }
        });
    }
}
