//! A condition variable over the fiber [`Mutex`].
//!
//! Waiters park in a strict-FIFO queue; the caller's mutex is released
//! *after* the waiting fiber has left its stack (deferred unlock), so a
//! signaller that acquires the mutex immediately cannot wake a fiber
//! whose suspension is still in flight. An internal mutex serialises
//! signal/broadcast against each other; the waiter counter alone
//! serialises them against waiters.

use crate::error::Error;
use crate::fiber::FiberRef;
use crate::sync::mutex::{MutexGuard, RawMutex};
use crate::worker;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering};
use weft_lockfree::MpscFifo;

pub struct Condvar {
    /// The one external mutex this condvar is used with; remembered on
    /// first wait and enforced on later ones.
    caller_mutex: AtomicPtr<RawMutex>,
    waiter_count: AtomicI64,
    waiters: MpscFifo<FiberRef>,
    internal: RawMutex,
}

// === impl Condvar ===

impl Condvar {
    pub fn new() -> Self {
        Self {
            caller_mutex: AtomicPtr::new(ptr::null_mut()),
            waiter_count: AtomicI64::new(0),
            waiters: MpscFifo::new(),
            internal: RawMutex::new(),
        }
    }

    /// Atomically releases `guard`'s mutex and parks until signalled;
    /// re-acquires the mutex before returning the guard.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] (with the guard handed back, still held)
    /// when the condvar has been used with a different mutex before.
    pub fn wait<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
    ) -> Result<MutexGuard<'a, T>, (MutexGuard<'a, T>, Error)> {
        let mutex = guard.mutex();
        let raw = ptr::from_ref(mutex.raw()).cast_mut();

        // remember (or verify) the caller's mutex identity
        if self
            .caller_mutex
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
            && self.caller_mutex.load(Ordering::Acquire) != raw
        {
            return Err((guard, Error::InvalidState));
        }

        self.waiter_count.fetch_add(1, Ordering::Release);

        // the guard's unlock happens via the deferred slot once we are
        // parked; forget it so Drop doesn't unlock early
        mem::forget(guard);
        worker::wait_in_mpsc_queue_and_unlock(&self.waiters, mutex.raw());

        // woken: take the external mutex back before returning
        mutex.raw().lock();
        Ok(mutex.guard_unchecked())
    }

    /// Wakes one waiter, if any.
    pub fn signal(&self) {
        self.internal.lock();
        let new_val = self.waiter_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if new_val >= 0 {
            worker::wake_from_mpsc_queue(&self.waiters, 1);
        } else {
            // no waiter was consumed; give the decrement back
            let restored = self.waiter_count.fetch_add(1, Ordering::AcqRel) + 1;
            debug_assert!(restored >= 0);
        }
        self.internal.unlock();
    }

    /// Wakes every currently parked waiter.
    pub fn broadcast(&self) {
        self.internal.lock();
        let original = self.waiter_count.swap(0, Ordering::Acquire);
        if original > 0 {
            worker::wake_from_mpsc_queue(
                &self.waiters,
                usize::try_from(original).unwrap_or(usize::MAX),
            );
        }
        self.internal.unlock();
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Condvar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condvar")
            .field("waiters", &self.waiter_count.load(Ordering::Relaxed))
            .finish()
    }
}
