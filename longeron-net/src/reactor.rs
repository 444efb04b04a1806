//! Edge-triggered readiness reactor.
//!
//! One process-wide epoll instance and one run-loop thread demultiplex fd
//! readiness onto executors. Each registered fd owns an [`FdRecord`]: a
//! FIFO of pending events per readiness kind plus the epoll mask currently
//! armed for the fd. Only the head event of each queue is active — the run
//! loop pops at most one event per readiness edge per kind, recomputes the
//! desired mask as the union of non-empty queues, re-arms, and posts the
//! popped events to the record's executor.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use longeron_core::executor::Executor;

use crate::event::{EventKind, IoEvent, Performed, KIND_COUNT};
use crate::sys::{Epoll, SelfPipe, EDGE, INTEREST_READ, INTEREST_WRITE, READABLE, WRITABLE};

/// Per-fd registration shared by the reactor and the socket that owns the
/// fd.
pub(crate) struct FdRecord {
    pub(crate) fd: RawFd,
    pub(crate) executor: Executor,
    queues: Mutex<EventQueues>,
}

struct EventQueues {
    /// Epoll mask currently armed for the fd.
    registered: u32,
    lanes: [std::collections::VecDeque<Box<dyn IoEvent>>; KIND_COUNT],
    /// Set once the fd is being torn down; late events are canceled.
    closed: bool,
}

impl FdRecord {
    pub(crate) fn new(fd: RawFd, executor: Executor) -> Arc<Self> {
        Arc::new(Self {
            fd,
            executor,
            queues: Mutex::new(EventQueues {
                registered: EDGE,
                lanes: Default::default(),
                closed: false,
            }),
        })
    }
}

/// Single-threaded readiness demultiplexer over epoll.
///
/// Process-wide: the polling handle and the run-loop thread must be unique,
/// so the instance is lazily constructed on first access and lives for the
/// process.
pub struct Reactor {
    epoll: Epoll,
    interrupt: SelfPipe,
    records: DashMap<RawFd, Arc<FdRecord>>,
    closed: AtomicBool,
    run_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    /// The process-wide reactor, constructed (and its run loop started) on
    /// first access.
    pub fn global() -> &'static Reactor {
        static GLOBAL: Lazy<&'static Reactor> = Lazy::new(|| {
            let reactor: &'static Reactor =
                Box::leak(Box::new(Reactor::new().expect("reactor: epoll setup failed")));
            let handle = thread::Builder::new()
                .name("longeron-reactor".into())
                .spawn(move || reactor.run_loop())
                .expect("reactor: failed to spawn run loop thread");
            *reactor.run_thread.lock() = Some(handle);
            reactor
        });
        *GLOBAL
    }

    fn new() -> io::Result<Self> {
        let epoll = Epoll::new()?;
        let interrupt = SelfPipe::new()?;
        epoll.add(interrupt.reader(), libc::EPOLLIN as u32)?;
        Ok(Self {
            epoll,
            interrupt,
            records: DashMap::new(),
            closed: AtomicBool::new(false),
            run_thread: Mutex::new(None),
        })
    }

    /// Install `record` as the owner of its fd.
    ///
    /// # Panics
    ///
    /// Panics if the fd is already registered; double registration is a
    /// contract violation.
    pub(crate) fn register_fd(&self, record: Arc<FdRecord>) -> io::Result<()> {
        let fd = record.fd;
        match self.records.entry(fd) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                panic!("reactor: fd {fd} registered twice");
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                self.epoll.add(fd, EDGE)?;
                slot.insert(record);
                trace!(fd, "reactor: fd registered");
                Ok(())
            }
        }
    }

    /// Queue `event` on the record and arm the fd for its readiness kind.
    ///
    /// Events on the same fd of the same kind complete in start order.
    pub(crate) fn start_event(&self, event: Box<dyn IoEvent>, record: &Arc<FdRecord>) {
        let mut queues = record.queues.lock();
        if queues.closed {
            drop(queues);
            event.cancel();
            return;
        }
        let kind = event.kind();
        queues.lanes[kind as usize].push_back(event);
        // Arming a previously idle kind must go through EPOLL_CTL_MOD even
        // if readiness is already high: MOD re-reports it as a fresh edge.
        self.rearm(record.fd, &mut queues, false);
    }

    /// Drop the record for `fd`, cancel everything still queued, and remove
    /// the fd from the epoll set. Cancellations are posted to the record's
    /// executor.
    pub(crate) fn deregister_fd(&self, fd: RawFd) {
        let Some((_, record)) = self.records.remove(&fd) else {
            return;
        };
        let drained: Vec<Box<dyn IoEvent>> = {
            let mut queues = record.queues.lock();
            queues.closed = true;
            queues.lanes.iter_mut().flat_map(|lane| lane.drain(..)).collect()
        };
        if let Err(err) = self.epoll.delete(fd) {
            debug!(fd, error = %err, "reactor: epoll delete failed");
        }
        trace!(fd, drained = drained.len(), "reactor: fd deregistered");
        for event in drained {
            record.executor.post(move || event.cancel());
        }
    }

    /// Recompute and apply the fd's epoll mask. `force` pushes the MOD even
    /// when the mask is unchanged — required after consuming an edge so the
    /// next one is delivered.
    fn rearm(&self, fd: RawFd, queues: &mut EventQueues, force: bool) {
        let mut mask = EDGE;
        if !queues.lanes[EventKind::Read as usize].is_empty() {
            mask |= INTEREST_READ;
        }
        if !queues.lanes[EventKind::Write as usize].is_empty() {
            mask |= INTEREST_WRITE;
        }
        if force || mask != queues.registered {
            if let Err(err) = self.epoll.modify(fd, mask) {
                warn!(fd, error = %err, "reactor: epoll modify failed");
            }
            queues.registered = mask;
        }
    }

    fn run_loop(&self) {
        let mut ready = Vec::with_capacity(64);
        loop {
            match self.epoll.wait(&mut ready) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Fatal: without the poller no further I/O can make
                    // progress.
                    error!(error = %err, "reactor: epoll wait failed, run loop terminating");
                    return;
                }
            }
            for event in &ready {
                let fd = event.u64 as RawFd;
                if fd == self.interrupt.reader() {
                    self.interrupt.drain();
                    if self.closed.load(Ordering::Acquire) {
                        debug!("reactor: run loop stopped");
                        return;
                    }
                    continue;
                }
                let Some(record) = self.records.get(&fd).map(|r| Arc::clone(r.value())) else {
                    // Raced with deregistration; the edge is stale.
                    continue;
                };
                self.dispatch(event.events, &record);
            }
        }
    }

    fn dispatch(&self, readiness: u32, record: &Arc<FdRecord>) {
        let mut popped: [Option<Box<dyn IoEvent>>; KIND_COUNT] = [None, None];
        {
            let mut queues = record.queues.lock();
            if readiness & READABLE != 0 {
                popped[EventKind::Read as usize] =
                    queues.lanes[EventKind::Read as usize].pop_front();
            }
            if readiness & WRITABLE != 0 {
                popped[EventKind::Write as usize] =
                    queues.lanes[EventKind::Write as usize].pop_front();
            }
            self.rearm(record.fd, &mut queues, true);
        }
        for event in popped.into_iter().flatten() {
            let record = Arc::clone(record);
            record.executor.clone().post(move || {
                if let Performed::Rearm(event) = event.perform() {
                    Reactor::global().start_event(event, &record);
                }
            });
        }
    }

    /// Stop the run loop: write the interrupt byte and join the thread.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.interrupt.wake() {
            warn!(error = %err, "reactor: interrupt write failed");
        }
        if let Some(handle) = self.run_thread.lock().take() {
            let _ = handle.join();
        }
    }
}
