//! Timer accuracy under one and many concurrent deadlines.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use longeron::{Executor, Timer};

#[test]
fn fires_within_tolerance() {
    longeron::dev_tracing::init_tracing();

    let executor = Executor::new();
    let timer = Timer::new(&executor);
    let begin = Instant::now();
    timer.expires_from_now(Duration::from_millis(100));

    let elapsed = Arc::new(Mutex::new(None));
    {
        let elapsed = Arc::clone(&elapsed);
        timer.async_wait(move |result| {
            result.unwrap();
            *elapsed.lock().unwrap() = Some(begin.elapsed());
        });
    }
    executor.run();

    let elapsed = elapsed.lock().unwrap().expect("timer fired");
    assert!(elapsed >= Duration::from_millis(90), "fired early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(150), "fired late: {elapsed:?}");
}

#[test]
fn a_thousand_staggered_timers_hold_their_deadlines() {
    longeron::dev_tracing::init_tracing();

    const COUNT: u64 = 1000;
    let executor = Executor::new();
    let timers: Vec<Timer> = (0..COUNT).map(|_| Timer::new(&executor)).collect();
    let violations = Arc::new(Mutex::new(Vec::new()));

    executor.add_work();
    let worker = {
        let executor = executor.clone();
        thread::spawn(move || executor.run())
    };

    for (i, timer) in timers.iter().enumerate().skip(1) {
        let deadline = Duration::from_millis(i as u64);
        let begin = Instant::now();
        timer.expires_from_now(deadline);
        let violations = Arc::clone(&violations);
        timer.async_wait(move |result| {
            result.unwrap();
            let elapsed = begin.elapsed();
            let early = deadline.mul_f64(0.9).saturating_sub(Duration::from_millis(10));
            let late = deadline.mul_f64(1.1) + Duration::from_millis(50);
            if elapsed < early || elapsed > late {
                violations.lock().unwrap().push((i, elapsed));
            }
        });
    }
    executor.remove_work();
    executor.run();
    worker.join().unwrap();

    let violations = violations.lock().unwrap();
    assert!(
        violations.is_empty(),
        "{} timers missed their window: {:?}",
        violations.len(),
        &violations[..violations.len().min(10)]
    );
}
