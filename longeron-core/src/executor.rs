//! Multi-threaded callback executor.
//!
//! An [`Executor`] is a FIFO of opaque nullary tasks plus a work counter.
//! Any number of threads become workers by calling [`Executor::run`]; `run`
//! returns only once the FIFO is empty *and* the work counter is zero, so
//! pending I/O keeps workers alive by holding work tokens.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Multi-threaded work queue executing nullary callbacks.
///
/// Cheap to clone; clones share the queue. No ordering is promised across
/// worker threads (serialize through a [`Strand`](crate::strand::Strand)
/// when ordering matters).
#[derive(Clone, Default)]
pub struct Executor {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    ready: Condvar,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Task>,
    work: usize,
}

impl Executor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `task` to the FIFO and wake one idle worker.
    ///
    /// The task runs exactly once, on some thread inside [`Executor::run`].
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        state.queue.push_back(Box::new(task));
        drop(state);
        self.inner.ready.notify_one();
    }

    /// Run tasks on the calling thread until the FIFO is empty and no work
    /// tokens are outstanding.
    ///
    /// Reentrant: any number of threads may run concurrently and they drain
    /// the same queue. A panicking task takes down its worker; the executor
    /// does not catch.
    pub fn run(&self) {
        loop {
            let mut state = self.inner.state.lock();
            let task = loop {
                if let Some(task) = state.queue.pop_front() {
                    break task;
                }
                if state.work == 0 {
                    return;
                }
                self.inner.ready.wait(&mut state);
            };
            drop(state);
            task();
        }
    }

    /// Take one work token, keeping [`Executor::run`] from returning.
    pub fn add_work(&self) {
        self.inner.state.lock().work += 1;
    }

    /// Release one work token.
    ///
    /// The release to zero wakes every idle worker so it can observe
    /// termination.
    ///
    /// # Panics
    ///
    /// Panics on underflow; releasing a token that was never taken is a
    /// contract violation.
    pub fn remove_work(&self) {
        let mut state = self.inner.state.lock();
        assert!(state.work > 0, "executor work counter underflow");
        state.work -= 1;
        if state.work == 0 {
            drop(state);
            self.inner.ready.notify_all();
        }
    }

    /// Take a work token bound to an RAII guard; released on drop.
    #[must_use]
    pub fn work(&self) -> WorkGuard {
        self.add_work();
        WorkGuard {
            executor: self.clone(),
        }
    }
}

/// RAII work token.
///
/// Holds the executor open while an out-of-queue completion (an in-flight
/// I/O event, a pending timer wait) is outstanding; releases on drop.
pub struct WorkGuard {
    executor: Executor,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.executor.remove_work();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn run_executes_posted_tasks() {
        let executor = Executor::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            executor.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        executor.run();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn run_returns_only_when_work_released() {
        let executor = Executor::new();
        executor.add_work();

        let worker = {
            let executor = executor.clone();
            thread::spawn(move || executor.run())
        };

        // The worker must stay parked while the token is held.
        thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_finished());

        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            executor.post(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        executor.remove_work();
        worker.join().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn work_guard_releases_on_drop() {
        let executor = Executor::new();
        let guard = executor.work();
        let worker = {
            let executor = executor.clone();
            thread::spawn(move || executor.run())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!worker.is_finished());
        drop(guard);
        worker.join().unwrap();
    }

    #[test]
    fn run_is_reentrant_across_threads() {
        let executor = Executor::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let counter = Arc::clone(&counter);
            executor.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let executor = executor.clone();
                thread::spawn(move || executor.run())
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
    }
}
