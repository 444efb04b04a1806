//! Stackful coroutine primitive.
//!
//! A [`Coroutine`] runs a body with a single resumption point:
//! [`Coroutine::resume`] transfers control into the body and blocks until
//! the body suspends through its [`Yielder`] or returns. The body runs on
//! its own dedicated 1 MiB stack, so it may call into arbitrary code —
//! including resuming *other* coroutines — between suspension points.
//!
//! Control transfer is a strict handoff: exactly one side runs at a time,
//! mediated by a condvar pair. A resumer therefore reads and writes state
//! shared with the body without racing it, exactly as with a same-thread
//! context switch.
//!
//! A panic escaping the body is captured and surfaced as
//! [`ResumeError::Panicked`] from the next `resume`; after that single
//! delivery the slot is cleared and further resumes are no-ops, as are
//! resumes of a body that has returned.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::error::ResumeError;

const STACK_SIZE: usize = 1024 * 1024;

type Body = Box<dyn FnOnce(&Yielder) + Send + 'static>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    /// No body installed yet.
    Fresh,
    /// Body installed, not yet started.
    Ready,
    /// Control is inside the body.
    Running,
    /// Body parked at a yield.
    Suspended,
    /// Body returned (or unwound).
    Finished,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Turn {
    Caller,
    Body,
}

struct State {
    phase: Phase,
    turn: Turn,
    body: Option<Body>,
    panic_note: Option<String>,
    canceled: bool,
}

struct Shared {
    state: Mutex<State>,
    /// Serializes resumers; held for the whole resume handoff.
    entry: Mutex<()>,
    caller_cv: Condvar,
    body_cv: Condvar,
}

/// Payload unwound through a suspended body when every handle is dropped;
/// the trampoline swallows it.
struct Unwound;

/// Stackful cooperative context with one resume/yield pair and one
/// transported-failure slot.
///
/// Cheap to clone; clones share the context (completion callbacks typically
/// capture a clone to resume from another thread). Dropping the last clone
/// of a suspended coroutine unwinds its body.
#[derive(Clone)]
pub struct Coroutine {
    shared: Arc<Shared>,
    _owner: Arc<OwnerGuard>,
}

struct OwnerGuard {
    shared: Arc<Shared>,
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.canceled = true;
        drop(state);
        self.shared.body_cv.notify_all();
    }
}

impl Default for Coroutine {
    fn default() -> Self {
        Self::new()
    }
}

impl Coroutine {
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                phase: Phase::Fresh,
                turn: Turn::Caller,
                body: None,
                panic_note: None,
                canceled: false,
            }),
            entry: Mutex::new(()),
            caller_cv: Condvar::new(),
            body_cv: Condvar::new(),
        });
        Self {
            _owner: Arc::new(OwnerGuard {
                shared: Arc::clone(&shared),
            }),
            shared,
        }
    }

    /// Install the body.
    ///
    /// Must be called before the first resume. Replaces any previous body
    /// when the coroutine has not started or has finished; the replacement
    /// starts fresh on the next resume.
    ///
    /// # Panics
    ///
    /// Panics if the current body is live (running or suspended).
    pub fn set_function(&self, f: impl FnOnce(&Yielder) + Send + 'static) {
        let mut state = self.shared.state.lock();
        match state.phase {
            Phase::Fresh | Phase::Ready | Phase::Finished => {
                state.body = Some(Box::new(f));
                state.phase = Phase::Ready;
                state.turn = Turn::Caller;
                state.panic_note = None;
            }
            Phase::Running | Phase::Suspended => {
                panic!("set_function while the coroutine body is live");
            }
        }
    }

    /// Transfer control into the body until it yields or returns.
    ///
    /// Resuming a finished coroutine is a no-op. If the body panicked since
    /// the previous resume, that failure is delivered here exactly once.
    ///
    /// # Panics
    ///
    /// Panics if no body was ever installed.
    pub fn resume(&self) -> Result<(), ResumeError> {
        let _entry = self.shared.entry.lock();
        let mut state = self.shared.state.lock();
        match state.phase {
            Phase::Fresh => panic!("resume before set_function"),
            Phase::Finished => return Self::take_failure(&mut state),
            Phase::Ready => {
                let body = state
                    .body
                    .take()
                    .expect("READY coroutine without a body");
                state.phase = Phase::Running;
                state.turn = Turn::Body;
                let shared = Arc::clone(&self.shared);
                thread::Builder::new()
                    .name("longeron-coroutine".into())
                    .stack_size(STACK_SIZE)
                    .spawn(move || trampoline(&shared, body))
                    .expect("failed to spawn coroutine stack");
            }
            Phase::Suspended => {
                state.phase = Phase::Running;
                state.turn = Turn::Body;
                self.shared.body_cv.notify_one();
            }
            // `entry` is held for the full handoff; control cannot still be
            // inside the body here.
            Phase::Running => unreachable!("concurrent resume"),
        }
        while state.turn != Turn::Caller {
            self.shared.caller_cv.wait(&mut state);
        }
        Self::take_failure(&mut state)
    }

    fn take_failure(state: &mut State) -> Result<(), ResumeError> {
        match state.panic_note.take() {
            Some(note) => Err(ResumeError::Panicked(note)),
            None => Ok(()),
        }
    }

    /// Whether the body has run to completion.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.state.lock().phase == Phase::Finished
    }
}

fn trampoline(shared: &Arc<Shared>, body: Body) {
    let yielder = Yielder {
        shared: Arc::clone(shared),
    };
    let result = panic::catch_unwind(AssertUnwindSafe(|| body(&yielder)));
    let mut state = shared.state.lock();
    if let Err(payload) = result {
        if payload.downcast_ref::<Unwound>().is_none() {
            state.panic_note = Some(panic_note(payload.as_ref()));
        }
    }
    state.phase = Phase::Finished;
    state.turn = Turn::Caller;
    drop(state);
    shared.caller_cv.notify_all();
}

fn panic_note(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}

/// Handle passed to a coroutine body; the only place a yield can happen.
pub struct Yielder {
    shared: Arc<Shared>,
}

impl Yielder {
    /// Suspend the body and hand control back to the resumer; returns when
    /// the coroutine is next resumed.
    pub fn yield_now(&self) {
        let mut state = self.shared.state.lock();
        state.phase = Phase::Suspended;
        state.turn = Turn::Caller;
        self.shared.caller_cv.notify_all();
        while state.turn != Turn::Body {
            if state.canceled {
                drop(state);
                // Quiet unwind (no panic hook) through the body; swallowed
                // by the trampoline.
                panic::resume_unwind(Box::new(Unwound));
            }
            self.shared.body_cv.wait(&mut state);
        }
        state.phase = Phase::Running;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fifo_suspend_resume() {
        let value = Arc::new(AtomicUsize::new(0));
        let coro = Coroutine::new();
        {
            let value = Arc::clone(&value);
            coro.set_function(move |y| {
                for _ in 0..3 {
                    value.fetch_add(1, Ordering::SeqCst);
                    y.yield_now();
                }
                value.fetch_add(1, Ordering::SeqCst);
            });
        }
        for i in 0..4 {
            coro.resume().unwrap();
            assert_eq!(value.load(Ordering::SeqCst), i + 1);
        }
        // Finished: further resumes are no-ops.
        coro.resume().unwrap();
        coro.resume().unwrap();
        assert_eq!(value.load(Ordering::SeqCst), 4);
        assert!(coro.is_finished());
    }

    #[test]
    fn panic_is_transported_once() {
        let value = Arc::new(AtomicUsize::new(0));
        let coro = Coroutine::new();
        {
            let value = Arc::clone(&value);
            coro.set_function(move |y| {
                value.fetch_add(1, Ordering::SeqCst);
                y.yield_now();
                panic!("boom");
            });
        }
        coro.resume().unwrap();
        assert_eq!(value.load(Ordering::SeqCst), 1);
        let err = coro.resume().unwrap_err();
        assert!(matches!(err, ResumeError::Panicked(note) if note.contains("boom")));
        assert_eq!(value.load(Ordering::SeqCst), 1);
        // Delivered exactly once; later resumes are clean no-ops.
        coro.resume().unwrap();
        coro.resume().unwrap();
        assert_eq!(value.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_coroutines_interleave() {
        let n = Arc::new(AtomicUsize::new(0));
        let inner = Coroutine::new();
        {
            let n = Arc::clone(&n);
            inner.set_function(move |y| {
                n.fetch_add(1, Ordering::SeqCst);
                y.yield_now();
                n.fetch_add(1, Ordering::SeqCst);
                y.yield_now();
                n.fetch_add(1, Ordering::SeqCst);
            });
        }
        let outer = Coroutine::new();
        {
            let inner = inner.clone();
            outer.set_function(move |y| {
                inner.resume().unwrap();
                y.yield_now();
                inner.resume().unwrap();
                y.yield_now();
                inner.resume().unwrap();
            });
        }
        for expected in 1..=3 {
            outer.resume().unwrap();
            assert_eq!(n.load(Ordering::SeqCst), expected);
        }
    }

    #[test]
    fn drop_unwinds_suspended_body() {
        struct SetOnDrop(Arc<AtomicUsize>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let coro = Coroutine::new();
        {
            let guard = SetOnDrop(Arc::clone(&dropped));
            coro.set_function(move |y| {
                let _guard = guard;
                loop {
                    y.yield_now();
                }
            });
        }
        coro.resume().unwrap();
        drop(coro);
        // The body thread unwinds asynchronously; give it a moment.
        for _ in 0..100 {
            if dropped.load(Ordering::SeqCst) == 1 {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("suspended body was not unwound on drop");
    }

    #[test]
    fn replacing_a_finished_body_restarts() {
        let value = Arc::new(AtomicUsize::new(0));
        let coro = Coroutine::new();
        {
            let value = Arc::clone(&value);
            coro.set_function(move |_| {
                value.fetch_add(1, Ordering::SeqCst);
            });
        }
        coro.resume().unwrap();
        assert!(coro.is_finished());
        {
            let value = Arc::clone(&value);
            coro.set_function(move |_| {
                value.fetch_add(10, Ordering::SeqCst);
            });
        }
        coro.resume().unwrap();
        assert_eq!(value.load(Ordering::SeqCst), 11);
    }
}
