//! Lifecycle basics: spawn, join, detach, yield, panics, teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing_subscriber::EnvFilter;
use weft::{Config, Error, Runtime};

fn runtime(workers: usize) -> Runtime {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Runtime::start(Config {
        workers,
        ..Config::default()
    })
    .expect("failed to start runtime")
}

#[test]
fn start_and_shutdown() {
    let rt = runtime(2);
    assert_eq!(rt.worker_count(), 2);
    rt.shutdown();
}

#[test]
fn spawn_and_join() {
    let rt = runtime(2);

    let handle = weft::spawn(|| 40 + 2);
    assert_eq!(handle.join().unwrap(), 42);

    rt.shutdown();
}

#[test]
fn join_returns_before_and_after_exit() {
    let rt = runtime(2);

    // joiner arrives first
    let handle = weft::spawn(|| {
        for _ in 0..10 {
            weft::yield_now();
        }
        "late"
    });
    assert_eq!(handle.join().unwrap(), "late");

    // fiber finishes first
    let handle = weft::spawn(|| "early");
    for _ in 0..50 {
        weft::yield_now();
    }
    assert_eq!(handle.join().unwrap(), "early");

    rt.shutdown();
}

#[test]
fn try_join_only_succeeds_once_finished() {
    let rt = runtime(1);

    let mut handle = weft::spawn(|| 7_u32);
    let value = loop {
        match handle.try_join() {
            Ok(value) => break value,
            Err((back, Error::WouldBlock)) => {
                handle = back;
                weft::yield_now();
            }
            Err((_, err)) => panic!("unexpected try_join error: {err}"),
        }
    };
    assert_eq!(value, 7);

    rt.shutdown();
}

#[test]
fn detached_fibers_run_to_completion() {
    let rt = runtime(2);

    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..16 {
        let ran = ran.clone();
        weft::spawn(move || {
            ran.fetch_add(1, Ordering::Relaxed);
        })
        .detach()
        .unwrap();
    }
    while ran.load(Ordering::Relaxed) < 16 {
        weft::yield_now();
    }

    rt.shutdown();
}

#[test]
fn dropping_the_handle_detaches() {
    let rt = runtime(2);

    let ran = Arc::new(AtomicUsize::new(0));
    {
        let ran = ran.clone();
        drop(weft::spawn(move || {
            ran.fetch_add(1, Ordering::Relaxed);
        }));
    }
    while ran.load(Ordering::Relaxed) == 0 {
        weft::yield_now();
    }

    rt.shutdown();
}

#[test]
fn fiber_panics_resume_at_the_joiner() {
    let rt = runtime(2);

    let handle = weft::spawn(|| -> u32 { panic!("boom in fiber") });
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handle.join()));
    let payload = outcome.expect_err("the fiber's panic must surface in join");
    let message = payload.downcast_ref::<&str>().copied().unwrap_or_default();
    assert_eq!(message, "boom in fiber");

    rt.shutdown();
}

#[test]
fn spawn_off_runtime_fails() {
    let err = weft::Builder::new().spawn(|| ()).unwrap_err();
    assert_eq!(err, Error::NotARuntimeThread);
}

#[test]
fn sequential_runtimes_on_one_thread() {
    for _ in 0..3 {
        let rt = runtime(2);
        let handle = weft::spawn(|| 1_u64);
        assert_eq!(handle.join().unwrap(), 1);
        rt.shutdown();
    }
}

#[test]
fn many_fibers_across_workers() {
    let rt = runtime(4);

    let counter = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..200)
        .map(|_| {
            let counter = counter.clone();
            weft::Builder::new()
                .stack_size(32 * 1024)
                .spawn(move || {
                    for _ in 0..10 {
                        weft::yield_now();
                    }
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap()
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), 200);
    assert!(rt.stats().yields > 0);

    rt.shutdown();
}

#[test]
fn heap_stacks_work_too() {
    let rt = runtime(2);

    let handle = weft::Builder::new()
        .stack_kind(weft::StackKind::Heap)
        .stack_size(64 * 1024)
        .spawn(|| {
            weft::yield_now();
            "heap"
        })
        .unwrap();
    assert_eq!(handle.join().unwrap(), "heap");

    rt.shutdown();
}
