//! Strand ordering and mutual-exclusion properties under real worker pools.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use longeron::{Coroutine, Executor, Strand};

#[test]
fn single_producer_observes_strict_fifo() {
    longeron::dev_tracing::init_tracing();

    const N: usize = 1_000_000;
    let executor = Executor::new();
    let strand = Strand::new(&executor);
    let last = Arc::new(Mutex::new(-1i64));

    executor.add_work();
    let producer = {
        let strand = strand.clone();
        let executor = executor.clone();
        let last = Arc::clone(&last);
        thread::spawn(move || {
            for s in 0..N as i64 {
                let last = Arc::clone(&last);
                strand.post(move || {
                    let mut last = last.lock().unwrap();
                    assert_eq!(*last + 1, s, "value skipped or reordered");
                    *last = s;
                });
            }
            executor.remove_work();
        })
    };

    executor.run();
    producer.join().unwrap();
    assert_eq!(*last.lock().unwrap(), N as i64 - 1);
}

#[test]
fn producers_and_workers_never_overlap() {
    longeron::dev_tracing::init_tracing();

    const PRODUCERS: usize = 8;
    const WORKERS: usize = 8;
    const PER_PRODUCER: usize = 100_000;

    let executor = Executor::new();
    let strand = Strand::new(&executor);
    // Deliberately not atomic: try_lock proves callbacks never overlap, and
    // the final count proves none were lost or run twice.
    let counter = Arc::new(Mutex::new(0usize));

    for _ in 0..PRODUCERS {
        executor.add_work();
    }
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let strand = strand.clone();
            let executor = executor.clone();
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..PER_PRODUCER {
                    let counter = Arc::clone(&counter);
                    strand.post(move || {
                        let mut counter = counter
                            .try_lock()
                            .expect("two strand callbacks ran concurrently");
                        *counter += 1;
                    });
                }
                executor.remove_work();
            })
        })
        .collect();

    let workers: Vec<_> = (0..WORKERS)
        .map(|_| {
            let executor = executor.clone();
            thread::spawn(move || executor.run())
        })
        .collect();

    for handle in producers {
        handle.join().unwrap();
    }
    for handle in workers {
        handle.join().unwrap();
    }
    assert_eq!(*counter.lock().unwrap(), PRODUCERS * PER_PRODUCER);
}

#[test]
fn coroutine_strand_round_trip() {
    longeron::dev_tracing::init_tracing();

    const N: usize = 100_000;
    const WORKERS: usize = 4;

    let executor = Executor::new();
    let strand = Strand::new(&executor);
    let counter = Arc::new(AtomicUsize::new(0));

    let coro = Coroutine::new();
    {
        let counter = Arc::clone(&counter);
        let executor_inner = executor.clone();
        let strand = strand.clone();
        let coro_inner = coro.clone();
        coro.set_function(move |y| {
            for _ in 0..N {
                counter.fetch_add(1, Ordering::SeqCst);
                let strand = strand.clone();
                let coro = coro_inner.clone();
                executor_inner.post(move || {
                    let coro = coro.clone();
                    strand.post(move || {
                        coro.resume().unwrap();
                    });
                });
                y.yield_now();
            }
            executor_inner.remove_work();
        });
    }

    executor.add_work();
    {
        let coro = coro.clone();
        strand.post(move || {
            coro.resume().unwrap();
        });
    }

    let workers: Vec<_> = (0..WORKERS)
        .map(|_| {
            let executor = executor.clone();
            thread::spawn(move || executor.run())
        })
        .collect();
    for handle in workers {
        handle.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), N);
}
