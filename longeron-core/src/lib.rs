//! Longeron Core
//!
//! This crate contains the runtime-agnostic concurrency building blocks:
//! - Multi-threaded callback executor with work-token accounting (`executor`)
//! - Serializing executor adapter (`strand`)
//! - Stackful coroutine primitive (`coroutine`)
//! - Deadline timers (`timer`)
//! - Cursor buffer for wire I/O (`buffer`)
//! - Error types (`error`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]

pub mod buffer;
pub mod coroutine;
pub mod error;
pub mod executor;
pub mod strand;
pub mod timer;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::buffer::SequenceBuffer;
    pub use crate::coroutine::{Coroutine, Yielder};
    pub use crate::error::{ResumeError, TimerError};
    pub use crate::executor::{Executor, WorkGuard};
    pub use crate::strand::Strand;
    pub use crate::timer::Timer;
}
