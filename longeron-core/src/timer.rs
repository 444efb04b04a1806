//! Deadline timers.
//!
//! A [`Timer`] schedules one callback on its executor at an absolute
//! deadline. All timers in the process share a single driver thread with a
//! monotonic min-heap, lazily started on first use. Re-arming or canceling
//! a timer delivers [`TimerError::Canceled`] to the pending wait; a pending
//! wait holds a work token so the executor cannot terminate under it.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::TimerError;
use crate::executor::{Executor, WorkGuard};

type WaitCallback = Box<dyn FnOnce(Result<(), TimerError>) + Send + 'static>;

static ENTRY_SEQ: AtomicU64 = AtomicU64::new(0);

struct Entry {
    deadline: Instant,
    seq: u64,
    generation: u64,
    timer: Arc<TimerShared>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap, we want the earliest deadline on
    // top, FIFO among equal deadlines.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Pending {
    callback: WaitCallback,
    executor: Executor,
    work: WorkGuard,
}

struct TimerState {
    deadline: Instant,
    generation: u64,
    pending: Option<Pending>,
}

struct TimerShared {
    state: Mutex<TimerState>,
}

struct Driver {
    heap: Mutex<BinaryHeap<Entry>>,
    tick: Condvar,
}

impl Driver {
    fn run_loop(&self) {
        let mut heap = self.heap.lock();
        loop {
            let now = Instant::now();
            while heap.peek().is_some_and(|e| e.deadline <= now) {
                let entry = heap.pop().expect("peeked entry");
                // Fire only if the wait is still the armed generation;
                // canceled waits were completed at cancel time.
                let fired = {
                    let mut timer = entry.timer.state.lock();
                    if timer.generation == entry.generation {
                        timer.pending.take()
                    } else {
                        None
                    }
                };
                if let Some(pending) = fired {
                    deliver(pending, Ok(()));
                }
            }
            match heap.peek().map(|e| e.deadline) {
                Some(deadline) => {
                    self.tick.wait_until(&mut heap, deadline);
                }
                None => self.tick.wait(&mut heap),
            }
        }
    }
}

fn deliver(pending: Pending, result: Result<(), TimerError>) {
    let Pending {
        callback,
        executor,
        work,
    } = pending;
    executor.post(move || {
        let _work = work;
        callback(result);
    });
}

fn driver() -> &'static Driver {
    static DRIVER: Lazy<&'static Driver> = Lazy::new(|| {
        let driver: &'static Driver = Box::leak(Box::new(Driver {
            heap: Mutex::new(BinaryHeap::new()),
            tick: Condvar::new(),
        }));
        thread::Builder::new()
            .name("longeron-timer".into())
            .spawn(move || driver.run_loop())
            .expect("failed to spawn timer driver thread");
        debug!("timer driver started");
        driver
    });
    *DRIVER
}

/// One-shot deadline timer bound to an [`Executor`].
pub struct Timer {
    executor: Executor,
    shared: Arc<TimerShared>,
}

impl Timer {
    /// Create a timer whose deadline is "now" until armed.
    #[must_use]
    pub fn new(executor: &Executor) -> Self {
        Self {
            executor: executor.clone(),
            shared: Arc::new(TimerShared {
                state: Mutex::new(TimerState {
                    deadline: Instant::now(),
                    generation: 0,
                    pending: None,
                }),
            }),
        }
    }

    /// Set the deadline `delay` from now.
    ///
    /// A wait pending from an earlier arm is canceled.
    pub fn expires_from_now(&self, delay: Duration) {
        let canceled = {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            state.deadline = Instant::now() + delay;
            state.pending.take()
        };
        if let Some(pending) = canceled {
            deliver(pending, Err(TimerError::Canceled));
        }
    }

    /// Schedule `callback` to run on the executor at the current deadline.
    ///
    /// One wait is pending at a time; scheduling over an existing wait
    /// cancels it first.
    pub fn async_wait(&self, callback: impl FnOnce(Result<(), TimerError>) + Send + 'static) {
        let (canceled, deadline, generation) = {
            let mut state = self.shared.state.lock();
            let canceled = state.pending.take();
            if canceled.is_some() {
                state.generation += 1;
            }
            state.pending = Some(Pending {
                callback: Box::new(callback),
                executor: self.executor.clone(),
                work: self.executor.work(),
            });
            (canceled, state.deadline, state.generation)
        };
        if let Some(pending) = canceled {
            deliver(pending, Err(TimerError::Canceled));
        }
        let driver = driver();
        driver.heap.lock().push(Entry {
            deadline,
            seq: ENTRY_SEQ.fetch_add(1, Ordering::Relaxed),
            generation,
            timer: Arc::clone(&self.shared),
        });
        driver.tick.notify_one();
    }

    /// Cancel a pending wait, delivering [`TimerError::Canceled`] to it.
    pub fn cancel(&self) {
        let canceled = {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            state.pending.take()
        };
        if let Some(pending) = canceled {
            deliver(pending, Err(TimerError::Canceled));
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}
