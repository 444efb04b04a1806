//! # Longeron
//!
//! A small asynchronous network and RPC substrate built around an
//! edge-triggered readiness reactor, a multi-threaded callback executor, a
//! serializing strand, a stackful coroutine primitive, and a self-healing
//! TCP session socket.
//!
//! ## Architecture
//!
//! Longeron is layered as two internal crates behind this facade:
//!
//! - **`longeron-core`**: executor, strand, coroutine, timers, buffers
//! - **`longeron-net`**: epoll reactor, typed fd events, TCP sockets, the
//!   consistent (self-healing) session socket, and the RPC session scaffold
//!
//! Control flow: user code posts callbacks to the [`Executor`] or starts an
//! async operation on a socket. Socket operations register interest with
//! the process-wide [`Reactor`]; its run-loop thread blocks on readiness
//! and posts completions back onto the executor. [`Strand`]s serialize
//! callback groups; [`ConsistentSocket`] uses coroutines to express its
//! connect/read/write loops as straight-line code.
//!
//! ## Quick start
//!
//! ```no_run
//! use longeron::{ConsistentSocket, Executor, Message};
//!
//! let executor = Executor::new();
//! let socket = ConsistentSocket::connect_to(&executor, "127.0.0.1:9000".parse().unwrap());
//! socket.start_connecting();
//! socket.async_send(Message::new(&b"ping"[..]), |result| {
//!     println!("sent: {result:?}");
//! });
//! executor.run();
//! ```

#![warn(missing_docs)]

pub use bytes;

pub use longeron_core::buffer::SequenceBuffer;
pub use longeron_core::coroutine::{Coroutine, Yielder};
pub use longeron_core::error::{ResumeError, TimerError};
pub use longeron_core::executor::{Executor, WorkGuard};
pub use longeron_core::strand::Strand;
pub use longeron_core::timer::Timer;

pub use longeron_net::consistent::{ConsistentSocket, SessionError, SessionResult};
pub use longeron_net::message::Message;
pub use longeron_net::options::SessionOptions;
pub use longeron_net::reactor::Reactor;
pub use longeron_net::session::{ServiceHandler, Session};
pub use longeron_net::tcp::TcpSocket;

pub mod dev_tracing;
