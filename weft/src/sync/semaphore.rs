//! A counting semaphore.
//!
//! The only primitive whose waiters park in the *MPMC* wait queue: any
//! releaser may pop any waiter, so ordering is best-effort rather than
//! FIFO. A releaser that finds the counter negative wakes a waiter *in
//! place of* incrementing — the permit transfers directly.

use crate::error::Error;
use crate::fiber::FiberRef;
use crate::worker::{self, Worker};
use std::sync::atomic::{AtomicI32, Ordering};
use weft_lockfree::MpmcFifo;

pub struct Semaphore {
    counter: AtomicI32,
    waiters: MpmcFifo<FiberRef>,
}

// === impl Semaphore ===

impl Semaphore {
    /// Creates a semaphore with `permits` initially available.
    ///
    /// Must be called on a runtime thread (the wait queue's sentinel node
    /// comes from the runtime's node cache), and the semaphore must be
    /// dropped before the runtime shuts down.
    ///
    /// # Errors
    ///
    /// [`Error::NotARuntimeThread`] off-runtime.
    pub fn new(permits: i32) -> Result<Self, Error> {
        let worker = Worker::try_current().ok_or(Error::NotARuntimeThread)?;
        Ok(Self {
            counter: AtomicI32::new(permits),
            waiters: MpmcFifo::new(worker.get_mpmc_node()),
        })
    }

    /// Takes a permit, parking the calling fiber when none is available.
    pub fn acquire(&self) {
        let val = self.counter.fetch_sub(1, Ordering::AcqRel) - 1;
        if val >= 0 {
            // we just got in, there was no contention
            return;
        }
        worker::wait_in_mpmc_queue(&self.waiters);
    }

    /// Takes a permit only if one is available right now.
    ///
    /// # Errors
    ///
    /// [`Error::WouldBlock`] when the counter is at or below zero.
    pub fn try_acquire(&self) -> Result<(), Error> {
        let mut counter = self.counter.load(Ordering::Acquire);
        while counter > 0 {
            match self.counter.compare_exchange_weak(
                counter,
                counter - 1,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => counter = actual,
            }
        }
        Err(Error::WouldBlock)
    }

    /// Returns a permit, waking a waiter if one is parked (and politely
    /// yielding to it).
    pub fn release(&self) {
        if self.release_internal() {
            // the semaphore was contended - be nice and let the waiter run
            Worker::current().yield_now();
        }
    }

    /// Returns whether a waiter was woken in place of the increment.
    fn release_internal(&self) -> bool {
        // the atomic operations below also publish writes made before the
        // release to whoever acquires the permit
        loop {
            let mut prev = self.counter.load(Ordering::Acquire);
            while prev < 0 {
                // a fiber is waiting: try to hand it the permit directly
                if worker::wake_from_mpmc_queue(&self.waiters, 0) == 1 {
                    self.counter.fetch_add(1, Ordering::AcqRel);
                    return true;
                }
                prev = self.counter.load(Ordering::Acquire);
            }
            if self
                .counter
                .compare_exchange_weak(prev, prev + 1, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return false;
            }
        }
    }

    /// The current counter: available permits when positive, parked (or
    /// arriving) waiters when negative.
    pub fn value(&self) -> i32 {
        self.counter.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("counter", &self.value())
            .finish()
    }
}
