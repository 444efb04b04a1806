//! Longeron Net
//!
//! The readiness reactor and socket layer:
//! - Process-wide edge-triggered epoll reactor (`reactor`)
//! - Typed per-fd I/O events (`event`)
//! - Non-blocking TCP stream socket (`tcp`)
//! - Message payloads and session framing (`message`)
//! - Self-healing, order-preserving session socket (`consistent`)
//! - Session-oriented RPC scaffold (`session`)
//! - Session tunables (`options`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]

pub mod consistent;
pub mod event;
pub mod message;
pub mod options;
pub mod reactor;
pub mod session;
mod sys;
pub mod tcp;

pub mod prelude {
    pub use crate::consistent::{ConsistentSocket, SessionError, SessionResult};
    pub use crate::event::EventKind;
    pub use crate::message::Message;
    pub use crate::options::SessionOptions;
    pub use crate::reactor::Reactor;
    pub use crate::session::{ServiceHandler, Session};
    pub use crate::tcp::TcpSocket;
}
