//! Serializing executor adapter.
//!
//! Callbacks posted through a [`Strand`] execute one at a time, in
//! submission order, on some worker of the underlying
//! [`Executor`](crate::executor::Executor). At most one drain pass is
//! scheduled per strand; producers race only on a lock-free pending stack
//! and an atomic `scheduled` flag.
//!
//! "Submission order" is the linearization order of the pending stack: a
//! single-threaded producer observes strict FIFO; concurrent producers may
//! interleave, but each producer's own submissions stay ordered.
//!
//! # Safety
//!
//! The pending stack is an intrusive Treiber stack of heap nodes passed
//! between threads as raw pointers. `push` publishes a node with a release
//! CAS; `take_all` detaches the whole list with an acquire swap, after which
//! the detached nodes are uniquely owned by the draining thread and freed
//! via `Box::from_raw` exactly once.

#![allow(unsafe_code)]

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use crate::executor::Executor;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Node {
    next: *mut Node,
    task: Task,
}

/// Multi-producer lock-free stack of pending callbacks.
///
/// `push` may run from any thread; `take_all` is only entered by the single
/// scheduled drain pass.
struct PendingStack {
    head: AtomicPtr<Node>,
}

impl PendingStack {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn push(&self, task: Task) {
        let node = Box::into_raw(Box::new(Node {
            next: ptr::null_mut(),
            task,
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` is not shared until the CAS below succeeds.
            unsafe {
                (*node).next = head;
            }
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    fn take_all(&self) -> *mut Node {
        self.head.swap(ptr::null_mut(), Ordering::Acquire)
    }

    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl Drop for PendingStack {
    fn drop(&mut self) {
        let mut node = self.take_all();
        while !node.is_null() {
            // SAFETY: detached nodes are uniquely owned here.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }
    }
}

/// Reverse a detached list in place so execution follows push order.
fn reverse(mut head: *mut Node) -> *mut Node {
    let mut last: *mut Node = ptr::null_mut();
    while !head.is_null() {
        // SAFETY: the detached list is uniquely owned by this thread.
        unsafe {
            let next = (*head).next;
            (*head).next = last;
            last = head;
            head = next;
        }
    }
    last
}

thread_local! {
    // Address of the strand currently draining on this thread; lets
    // `dispatch` run inline instead of re-posting.
    static ACTIVE_STRAND: Cell<usize> = const { Cell::new(0) };
}

/// Serializing adapter over an [`Executor`].
///
/// Cheap to clone; clones share the pending queue.
#[derive(Clone)]
pub struct Strand {
    inner: Arc<Inner>,
}

struct Inner {
    pending: PendingStack,
    scheduled: AtomicBool,
    executor: Executor,
}

impl Strand {
    #[must_use]
    pub fn new(executor: &Executor) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: PendingStack::new(),
                scheduled: AtomicBool::new(false),
                executor: executor.clone(),
            }),
        }
    }

    /// Submit `task`.
    ///
    /// Tasks submitted through the same strand execute in submission order
    /// and never concurrently with each other, each on some executor
    /// worker.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.pending.push(Box::new(task));
        if self
            .inner
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let strand = self.clone();
            self.inner.executor.post(move || strand.perform());
        }
    }

    /// Run `task` inline when the caller is already executing on this
    /// strand; otherwise behave as [`Strand::post`].
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        let me = Arc::as_ptr(&self.inner) as usize;
        if ACTIVE_STRAND.with(Cell::get) == me {
            task();
        } else {
            self.post(task);
        }
    }

    /// Wrap `task` into a callable that posts it through this strand.
    #[must_use]
    pub fn wrap(&self, task: impl FnOnce() + Send + 'static) -> impl FnOnce() + Send + 'static {
        let strand = self.clone();
        move || strand.post(task)
    }

    /// Drain pass; at most one in flight per strand.
    fn perform(&self) {
        let me = Arc::as_ptr(&self.inner) as usize;
        let previous = ACTIVE_STRAND.with(|active| active.replace(me));
        loop {
            if self.inner.pending.is_empty() {
                self.inner.scheduled.store(false, Ordering::Release);
                // A producer that pushed between the emptiness check and the
                // flag clear saw `scheduled == true` and did not schedule a
                // new pass; recheck before leaving.
                if self.inner.pending.is_empty()
                    || self
                        .inner
                        .scheduled
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                {
                    break;
                }
            }
            let mut node = reverse(self.inner.pending.take_all());
            while !node.is_null() {
                // SAFETY: detached nodes are uniquely owned; each is freed
                // exactly once.
                let boxed = unsafe { Box::from_raw(node) };
                node = boxed.next;
                (boxed.task)();
            }
        }
        ACTIVE_STRAND.with(|active| active.set(previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn single_producer_observes_fifo() {
        let executor = Executor::new();
        let strand = Strand::new(&executor);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..1000 {
            let seen = Arc::clone(&seen);
            strand.post(move || seen.lock().push(i));
        }
        executor.run();
        let seen = seen.lock();
        assert_eq!(seen.len(), 1000);
        assert!(seen.windows(2).all(|w| w[0] + 1 == w[1]));
    }

    #[test]
    fn dispatch_runs_inline_inside_strand() {
        let executor = Executor::new();
        let strand = Strand::new(&executor);
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            let inner = strand.clone();
            strand.post(move || {
                // Inside a drain pass: must run inline, before this closure
                // returns.
                let counter2 = Arc::clone(&counter);
                inner.dispatch(move || {
                    counter2.fetch_add(1, Ordering::SeqCst);
                });
                assert_eq!(counter.load(Ordering::SeqCst), 1);
            });
        }
        executor.run();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wrap_posts_through_strand() {
        let executor = Executor::new();
        let strand = Strand::new(&executor);
        let counter = Arc::new(AtomicUsize::new(0));
        let wrapped = {
            let counter = Arc::clone(&counter);
            strand.wrap(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };
        executor.post(wrapped);
        executor.run();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn posted_tasks_survive_handle_drop() {
        let executor = Executor::new();
        let strand = Strand::new(&executor);
        let flag = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let flag = Arc::clone(&flag);
            strand.post(move || {
                flag.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(strand);
        // The scheduled drain pass keeps the shared state alive and still
        // runs everything that was posted.
        executor.run();
        assert_eq!(flag.load(Ordering::SeqCst), 10);
    }
}
