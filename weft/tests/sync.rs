//! Synchronisation primitives under multi-worker stress.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use tracing_subscriber::EnvFilter;
use weft::sync::{Barrier, Condvar, Mutex, MultiSignal, RwLock, Semaphore, Signal, SpinLock};
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
fn mutex_counter_stress() {
    const FIBERS: usize = 50;
    const INCREMENTS: usize = 2_000;

    let rt = runtime(4);

    let counter = Arc::new(Mutex::new(0_u64));
    let handles: Vec<_> = (0..FIBERS)
        .map(|_| {
            let counter = counter.clone();
            weft::spawn(move || {
                for _ in 0..INCREMENTS {
                    *counter.lock() += 1;
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*counter.lock(), (FIBERS * INCREMENTS) as u64);
    assert!(rt.stats().yields > 0);

    rt.shutdown();
}

#[test]
fn mutex_exclusion_is_observable() {
    const FIBERS: usize = 16;

    let rt = runtime(4);

    let lock = Arc::new(Mutex::new(()));
    let inside = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..FIBERS)
        .map(|_| {
            let lock = lock.clone();
            let inside = inside.clone();
            weft::spawn(move || {
                for _ in 0..500 {
                    let guard = lock.lock();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    weft::yield_now();
                    assert_eq!(inside.fetch_sub(1, Ordering::SeqCst), 1);
                    drop(guard);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    rt.shutdown();
}

#[test]
fn try_lock_fails_while_held() {
    let rt = runtime(1);

    let lock = Mutex::new(5);
    let guard = lock.lock();
    assert_eq!(lock.try_lock().unwrap_err(), Error::WouldBlock);
    drop(guard);
    assert_eq!(*lock.try_lock().unwrap(), 5);

    rt.shutdown();
}

#[test]
fn condvar_producer_consumer() {
    const ITEMS: usize = 2_000;

    let rt = runtime(2);

    struct Shared {
        queue: Mutex<Vec<usize>>,
        ready: Condvar,
    }
    let shared = Arc::new(Shared {
        queue: Mutex::new(Vec::new()),
        ready: Condvar::new(),
    });

    let consumer = {
        let shared = shared.clone();
        weft::spawn(move || {
            let mut taken = Vec::new();
            let mut guard = shared.queue.lock();
            while taken.len() < ITEMS {
                while guard.is_empty() {
                    guard = shared.ready.wait(guard).unwrap();
                }
                taken.append(&mut guard);
            }
            taken
        })
    };

    for i in 0..ITEMS {
        shared.queue.lock().push(i);
        shared.ready.signal();
    }

    let taken = consumer.join().unwrap();
    assert_eq!(taken.len(), ITEMS);
    rt.shutdown();
}

#[test]
fn condvar_broadcast_releases_everyone() {
    const WAITERS: usize = 8;

    let rt = runtime(2);

    struct Shared {
        state: Mutex<bool>,
        go: Condvar,
        parked: AtomicUsize,
    }
    let shared = Arc::new(Shared {
        state: Mutex::new(false),
        go: Condvar::new(),
        parked: AtomicUsize::new(0),
    });

    let handles: Vec<_> = (0..WAITERS)
        .map(|_| {
            let shared = shared.clone();
            weft::spawn(move || {
                let mut guard = shared.state.lock();
                while !*guard {
                    shared.parked.fetch_add(1, Ordering::SeqCst);
                    guard = shared.go.wait(guard).unwrap();
                    shared.parked.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    // wait until everyone is parked, then flip the state and broadcast
    while shared.parked.load(Ordering::SeqCst) < WAITERS {
        weft::yield_now();
    }
    *shared.state.lock() = true;
    shared.go.broadcast();

    for handle in handles {
        handle.join().unwrap();
    }
    rt.shutdown();
}

#[test]
fn condvar_enforces_its_mutex() {
    let rt = runtime(2);

    let first = Arc::new(Mutex::new(false));
    let second = Mutex::new(());
    let cond = Arc::new(Condvar::new());
    let parked = Arc::new(AtomicUsize::new(0));

    // bind the condvar to `first` with a real wait
    let waiter = {
        let first = first.clone();
        let cond = cond.clone();
        let parked = parked.clone();
        weft::spawn(move || {
            let mut guard = first.lock();
            parked.store(1, Ordering::SeqCst);
            while !*guard {
                guard = cond.wait(guard).unwrap();
            }
        })
    };

    // once we can re-take the mutex after `parked`, the waiter's
    // atomic-unlock has completed, i.e. it is really parked
    while parked.load(Ordering::SeqCst) == 0 {
        weft::yield_now();
    }
    *first.lock() = true;
    cond.signal();
    waiter.join().unwrap();

    // a different mutex is refused from now on
    let guard = second.lock();
    let Err((guard, err)) = cond.wait(guard) else {
        panic!("condvar accepted a mismatched mutex");
    };
    assert_eq!(err, Error::InvalidState);
    drop(guard);

    rt.shutdown();
}

#[test]
fn semaphore_bounds_concurrency() {
    const PERMITS: i32 = 3;
    const FIBERS: usize = 24;

    let rt = runtime(4);

    let semaphore = Arc::new(Semaphore::new(PERMITS).unwrap());
    let inside = Arc::new(AtomicI32::new(0));
    let peak = Arc::new(AtomicI32::new(0));

    let handles: Vec<_> = (0..FIBERS)
        .map(|_| {
            let semaphore = semaphore.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            weft::spawn(move || {
                for _ in 0..200 {
                    semaphore.acquire();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    assert!(now <= PERMITS);
                    weft::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                    semaphore.release();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= PERMITS);
    assert_eq!(semaphore.value(), PERMITS);

    rt.shutdown();
}

#[test]
fn try_acquire_respects_the_counter() {
    let rt = runtime(1);

    let semaphore = Semaphore::new(1).unwrap();
    semaphore.try_acquire().unwrap();
    assert_eq!(semaphore.try_acquire().unwrap_err(), Error::WouldBlock);
    semaphore.release();
    semaphore.try_acquire().unwrap();
    semaphore.release();

    rt.shutdown();
}

#[test]
fn barrier_cycles_with_one_leader_each() {
    const FIBERS: u32 = 100;
    const CYCLES: usize = 2;

    let rt = runtime(4);

    let barrier = Arc::new(Barrier::new(FIBERS).unwrap());
    let leaders = Arc::new(AtomicUsize::new(0));
    let arrived = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..FIBERS)
        .map(|_| {
            let barrier = barrier.clone();
            let leaders = leaders.clone();
            let arrived = arrived.clone();
            weft::spawn(move || {
                for cycle in 0..CYCLES {
                    arrived.fetch_add(1, Ordering::SeqCst);
                    let result = barrier.wait();
                    // every arrival of the finished cycle must be visible
                    assert!(arrived.load(Ordering::SeqCst) >= (cycle + 1) * FIBERS as usize);
                    if result.is_leader() {
                        leaders.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(leaders.load(Ordering::SeqCst), CYCLES);

    rt.shutdown();
}

#[test]
fn rwlock_readers_share_writers_exclude() {
    const FIBERS: usize = 40;
    const OPS: usize = 300;

    let rt = runtime(2);

    let lock = Arc::new(RwLock::new(0_u64));
    let readers = Arc::new(AtomicI32::new(0));
    let writers = Arc::new(AtomicI32::new(0));

    let handles: Vec<_> = (0..FIBERS)
        .map(|f| {
            let lock = lock.clone();
            let readers = readers.clone();
            let writers = writers.clone();
            weft::spawn(move || {
                for op in 0..OPS {
                    match (f + op) % 4 {
                        0 => {
                            let guard = lock.write();
                            assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                            assert_eq!(readers.load(Ordering::SeqCst), 0);
                            weft::yield_now();
                            writers.fetch_sub(1, Ordering::SeqCst);
                            drop(guard);
                        }
                        1 => {
                            if let Ok(guard) = lock.try_write() {
                                assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                                assert_eq!(readers.load(Ordering::SeqCst), 0);
                                writers.fetch_sub(1, Ordering::SeqCst);
                                drop(guard);
                            }
                        }
                        2 => {
                            let guard = lock.read();
                            assert_eq!(writers.load(Ordering::SeqCst), 0);
                            readers.fetch_add(1, Ordering::SeqCst);
                            weft::yield_now();
                            readers.fetch_sub(1, Ordering::SeqCst);
                            drop(guard);
                        }
                        _ => {
                            if let Ok(guard) = lock.try_read() {
                                assert_eq!(writers.load(Ordering::SeqCst), 0);
                                readers.fetch_add(1, Ordering::SeqCst);
                                readers.fetch_sub(1, Ordering::SeqCst);
                                drop(guard);
                            }
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    rt.shutdown();
}

#[test]
fn signal_wakes_its_single_waiter() {
    let rt = runtime(2);

    let signal = Arc::new(Signal::new());
    let observed = Arc::new(AtomicUsize::new(0));

    let waiter = {
        let signal = signal.clone();
        let observed = observed.clone();
        weft::spawn(move || {
            for _ in 0..100 {
                signal.wait();
                observed.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    for i in 0..100 {
        // either this wakes the parked waiter, or the waiter's next
        // wait consumes the pending raise; never both
        signal.raise();
        while observed.load(Ordering::SeqCst) <= i {
            weft::yield_now();
        }
    }

    waiter.join().unwrap();
    assert_eq!(observed.load(Ordering::SeqCst), 100);
    rt.shutdown();
}

#[test]
fn multi_signal_wakes_many_waiters() {
    const WAITERS: usize = 8;

    let rt = runtime(2);

    let signal = Arc::new(MultiSignal::new());
    let woken = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..WAITERS)
        .map(|_| {
            let signal = signal.clone();
            let woken = woken.clone();
            weft::spawn(move || {
                signal.wait();
                woken.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    // raise until every waiter got through; a raise that found no waiter
    // parks and is consumed by a late waiter's wait, so nothing is lost
    while woken.load(Ordering::SeqCst) < WAITERS {
        signal.raise();
        weft::yield_now();
    }

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), WAITERS);
    rt.shutdown();
}

#[test]
fn spinlock_guards_short_sections() {
    let rt = runtime(4);

    let lock = Arc::new(SpinLock::new(0_u64));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let lock = lock.clone();
            weft::spawn(move || {
                for _ in 0..10_000 {
                    *lock.lock() += 1;
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*lock.lock(), 80_000);
    rt.shutdown();
}
