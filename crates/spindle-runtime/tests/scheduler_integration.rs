//! Scheduler integration tests
//!
//! End-to-end runs of the scheduler:
//! - Liveness and FIFO order on one thread
//! - Failure capture (panic, error return, stack overflow)
//! - Load balancing across threads
//! - Quiescence, reuse and external stop
//!
//! # Running Tests
//! ```bash
//! cargo test --test scheduler_integration
//! ```

mod common;

use common::initialize_logger;
use spindle_runtime::{RuntimeError, Scheduler, SchedulerConfig};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ===== Liveness =====

#[test]
fn test_all_tasks_run_to_completion() {
    initialize_logger();
    let scheduler = Scheduler::with_threads(1).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..100 {
        let counter = counter.clone();
        scheduler.spawn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            spindle_runtime::yield_now();
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    scheduler.run().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 200);
    assert_eq!(scheduler.stats().tasks_completed, 100);
}

#[test]
fn test_fifo_order_on_one_thread() {
    initialize_logger();
    let scheduler = Scheduler::with_threads(1).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..5 {
        let order = order.clone();
        scheduler.spawn(move || {
            order.lock().unwrap().push(i);
            spindle_runtime::yield_now();
            order.lock().unwrap().push(i + 10);
        });
    }

    scheduler.run().unwrap();
    assert_eq!(
        *order.lock().unwrap(),
        vec![0, 1, 2, 3, 4, 10, 11, 12, 13, 14]
    );
}

#[test]
fn test_nested_spawn() {
    initialize_logger();
    let scheduler = Scheduler::with_threads(1).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let outer = counter.clone();
    scheduler.spawn(move || -> Result<(), RuntimeError> {
        for _ in 0..10 {
            let counter = outer.clone();
            spindle_runtime::spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })?;
        }
        Ok(())
    });

    scheduler.run().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 10);
    assert_eq!(scheduler.stats().tasks_spawned, 11);
}

#[test]
fn test_park_and_wake() {
    initialize_logger();
    let scheduler = Scheduler::with_threads(1).unwrap();
    let sleeper = Arc::new(Mutex::new(None));
    let woken = Arc::new(AtomicBool::new(false));

    let slot = sleeper.clone();
    let flag = woken.clone();
    scheduler.spawn(move || {
        *slot.lock().unwrap() = spindle_runtime::current();
        while !flag.load(Ordering::SeqCst) {
            spindle_runtime::park();
        }
    });

    let slot = sleeper.clone();
    let flag = woken.clone();
    scheduler.spawn(move || {
        flag.store(true, Ordering::SeqCst);
        if let Some(handle) = slot.lock().unwrap().as_ref() {
            assert!(handle.wake());
        }
    });

    scheduler.run().unwrap();
    assert!(woken.load(Ordering::SeqCst));
}

// ===== Failure Capture =====

#[test]
fn test_panic_is_reported() {
    initialize_logger();
    let scheduler = Scheduler::with_threads(1).unwrap();
    let id = scheduler.spawn::<_, ()>(|| panic!("task blew up"));

    match scheduler.run() {
        Err(RuntimeError::TaskPanicked { task, message }) => {
            assert_eq!(task, id);
            assert_eq!(message, "task blew up");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_error_return_is_reported() {
    initialize_logger();
    let scheduler = Scheduler::with_threads(1).unwrap();
    let id = scheduler.spawn(|| -> Result<(), std::io::Error> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"))
    });

    match scheduler.run() {
        Err(RuntimeError::TaskFailed { task, source }) => {
            assert_eq!(task, id);
            assert_eq!(source.to_string(), "disk on fire");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_failure_stops_multi_threaded_run() {
    initialize_logger();
    let scheduler = Scheduler::with_threads(4).unwrap();
    for _ in 0..8 {
        scheduler.spawn(|| {
            for _ in 0..100 {
                spindle_runtime::yield_now();
            }
        });
    }
    scheduler.spawn::<_, ()>(|| panic!("first"));

    assert!(matches!(
        scheduler.run(),
        Err(RuntimeError::TaskPanicked { .. })
    ));
}

const OVERFLOW_STACK: usize = 64 * 1024;

/// Recurse until the frame address is `limit` bytes below `start`, then
/// yield from there.
fn descend(start: usize, limit: usize) -> usize {
    let pad = std::hint::black_box([1u8; 1024]);
    let here = &pad as *const _ as usize;
    if start.saturating_sub(here) >= limit {
        spindle_runtime::yield_now();
        return pad[0] as usize;
    }
    descend(start, limit) + pad[1] as usize
}

#[test]
fn test_stack_overflow_is_detected() {
    initialize_logger();
    let scheduler = Scheduler::with_threads(1).unwrap();

    let id = scheduler.spawn_with_stack_size(
        || {
            let marker = 0u8;
            let start = std::hint::black_box(&marker) as *const u8 as usize;
            // Past the usable stack, inside the soft guard zone.
            descend(start, OVERFLOW_STACK + 4 * 1024);
        },
        OVERFLOW_STACK,
    );
    // Gives the overflowing task something to switch to.
    scheduler.spawn(|| {
        for _ in 0..1000 {
            spindle_runtime::yield_now();
        }
    });

    match scheduler.run() {
        Err(RuntimeError::StackOverflow(task)) => assert_eq!(task, id),
        other => panic!("unexpected result: {:?}", other),
    }
}

/// Recurse forever, yielding at every level.
fn descend_yielding(depth: usize) -> usize {
    let pad = std::hint::black_box([depth as u8; 512]);
    spindle_runtime::yield_now();
    descend_yielding(depth + 1) + pad[3] as usize
}

#[test]
fn test_stack_overflow_detected_in_lone_task() {
    initialize_logger();
    let scheduler = Scheduler::with_threads(1).unwrap();
    let id = scheduler.spawn_with_stack_size(
        || {
            descend_yielding(0);
        },
        OVERFLOW_STACK,
    );

    match scheduler.run() {
        Err(RuntimeError::StackOverflow(task)) => assert_eq!(task, id),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(scheduler.stats().tasks_completed, 1);
}

#[test]
fn test_stack_overflow_stops_other_threads() {
    initialize_logger();
    let scheduler = Scheduler::with_threads(2).unwrap();
    for _ in 0..4 {
        scheduler.spawn::<_, ()>(|| loop {
            spindle_runtime::yield_now();
        });
    }
    let id = scheduler.spawn_with_stack_size(
        || {
            descend_yielding(0);
        },
        OVERFLOW_STACK,
    );

    match scheduler.run() {
        Err(RuntimeError::StackOverflow(task)) => assert_eq!(task, id),
        other => panic!("unexpected result: {:?}", other),
    }
}

// ===== Load Balancing =====

#[test]
fn test_tasks_spread_across_threads() {
    initialize_logger();
    let config = SchedulerConfig::with_threads(10).monitor_tick(Duration::from_millis(1));
    let scheduler = Scheduler::new(config).unwrap();
    let seen = Arc::new(Mutex::new(HashSet::new()));

    for _ in 0..100 {
        let seen = seen.clone();
        scheduler.spawn(move || {
            std::thread::sleep(Duration::from_micros(100));
            for _ in 0..50 {
                if let Some(id) = spindle_runtime::current_thread_id() {
                    seen.lock().unwrap().insert(id);
                }
                spindle_runtime::yield_now();
            }
        });
    }

    scheduler.run().unwrap();
    assert!(seen.lock().unwrap().len() >= 2);
    assert_eq!(scheduler.stats().tasks_completed, 100);
}

// ===== Lifecycle =====

#[test]
fn test_multi_threaded_run_stops_when_idle() {
    initialize_logger();
    let scheduler = Scheduler::with_threads(4).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..20 {
        let counter = counter.clone();
        scheduler.spawn(move || -> Result<(), RuntimeError> {
            let inner = counter.clone();
            spindle_runtime::spawn(move || {
                inner.fetch_add(1, Ordering::SeqCst);
            })?;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    scheduler.run().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 40);
}

#[test]
fn test_scheduler_reuse() {
    initialize_logger();
    let scheduler = Scheduler::with_threads(2).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    for round in 1..=3 {
        for _ in 0..5 {
            let counter = counter.clone();
            scheduler.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        scheduler.run().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), round * 5);
    }
}

#[test]
fn test_failed_run_can_be_followed_by_clean_run() {
    initialize_logger();
    let scheduler = Scheduler::with_threads(1).unwrap();
    scheduler.spawn::<_, ()>(|| panic!("once"));
    assert!(scheduler.run().is_err());

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    scheduler.spawn(move || flag.store(true, Ordering::SeqCst));
    scheduler.run().unwrap();
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn test_external_stop() {
    initialize_logger();
    let scheduler = Arc::new(Scheduler::with_threads(1).unwrap());
    let started = Arc::new(AtomicBool::new(false));

    let flag = started.clone();
    scheduler.spawn::<_, ()>(move || loop {
        flag.store(true, Ordering::SeqCst);
        spindle_runtime::yield_now();
    });

    let stopper = {
        let scheduler = scheduler.clone();
        let started = started.clone();
        std::thread::spawn(move || {
            while !started.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            scheduler.stop();
        })
    };

    scheduler.run().unwrap();
    stopper.join().unwrap();
}
