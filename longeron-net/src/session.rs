//! Session-oriented RPC scaffold.
//!
//! A [`Session`] pumps inbound messages off a [`ConsistentSocket`] one at a
//! time on a receive coroutine and hands each to a [`ServiceHandler`] on an
//! executor worker. It defines no wire protocol and no dispatch tables —
//! those belong to the service built on top.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use longeron_core::coroutine::Coroutine;
use longeron_core::executor::Executor;

use crate::consistent::{ConsistentSocket, SessionResult};
use crate::message::Message;

/// Dispatch surface an RPC service implements.
pub trait ServiceHandler: Send + Sync + 'static {
    /// Handle one inbound message; runs on an executor worker.
    fn dispatch(&self, message: Message, session: &Arc<Session>);

    /// The session's transport died; drop any bookkeeping for it.
    fn remove_session(&self, session: &Arc<Session>);
}

/// One logical peer conversation over a consistent socket.
pub struct Session {
    executor: Executor,
    socket: Arc<ConsistentSocket>,
    handler: Arc<dyn ServiceHandler>,
    recv_coro: Coroutine,
    recv_slot: Mutex<Option<SessionResult<Message>>>,
    shutdown: AtomicBool,
}

impl Session {
    #[must_use]
    pub fn new(
        executor: &Executor,
        socket: Arc<ConsistentSocket>,
        handler: Arc<dyn ServiceHandler>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            executor: executor.clone(),
            socket,
            handler,
            recv_coro: Coroutine::new(),
            recv_slot: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });
        this.install_loop();
        this
    }

    pub fn socket(&self) -> &Arc<ConsistentSocket> {
        &self.socket
    }

    /// Start pumping inbound messages.
    pub fn start(&self) {
        if let Err(err) = self.recv_coro.resume() {
            info!(error = %err, "session: receive loop panicked");
        }
    }

    fn install_loop(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.recv_coro.set_function(move |y| loop {
            let Some(this) = weak.upgrade() else { return };
            if this.shutdown.load(Ordering::Acquire) {
                return;
            }
            {
                let session = Arc::clone(&this);
                this.socket.async_recv(move |result| {
                    *session.recv_slot.lock() = Some(result);
                    // Completions can run inline on this very loop's stack
                    // (terminal fast paths); wake through the executor.
                    let waker = Arc::clone(&session);
                    session.executor.post(move || {
                        let _ = waker.recv_coro.resume();
                    });
                });
            }
            let result = loop {
                if let Some(result) = this.recv_slot.lock().take() {
                    break result;
                }
                if this.shutdown.load(Ordering::Acquire) {
                    return;
                }
                y.yield_now();
            };
            match result {
                Ok(message) => {
                    let handler = Arc::clone(&this.handler);
                    let session = Arc::clone(&this);
                    this.executor
                        .post(move || handler.dispatch(message, &session));
                }
                Err(err) => {
                    // Receive failed; this conversation is over.
                    debug!(error = %err, "session: receive loop ending");
                    this.handler.remove_session(&this);
                    return;
                }
            }
            drop(this);
        });
    }

    /// Send `message` back to the peer; failures are logged, not surfaced.
    pub fn send_response(&self, message: Message) {
        let socket = &self.socket;
        socket.async_send(message, |result| {
            if let Err(err) = result {
                info!(error = %err, "session: send response failed");
            }
        });
    }

    /// Stop the pump and tear down the transport.
    pub fn shutdown(self: &Arc<Self>) {
        self.shutdown.store(true, Ordering::Release);
        self.socket.shutdown();
        let waker = Arc::clone(self);
        self.executor.post(move || {
            let _ = waker.recv_coro.resume();
        });
    }
}
