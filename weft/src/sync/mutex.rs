//! The fiber mutex.
//!
//! One atomic counter, initially 1: lockers fetch-sub and own the lock on
//! reaching exactly 0; anything below parks in a strict-FIFO MPSC wait
//! queue. Unlockers fetch-add and, if the result shows waiters, hand the
//! lock directly to the oldest one (ownership transfers without the wakee
//! re-contending) and politely yield so it can run.

use crate::error::Error;
use crate::fiber::FiberRef;
use crate::stats::WorkerStats;
use crate::worker::{self, Worker};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, Ordering};
use weft_lockfree::MpscFifo;

pub(crate) struct RawMutex {
    counter: AtomicI32,
    waiters: MpscFifo<FiberRef>,
}

// === impl RawMutex ===

impl RawMutex {
    pub(crate) fn new() -> Self {
        Self {
            counter: AtomicI32::new(1),
            waiters: MpscFifo::new(),
        }
    }

    pub(crate) fn lock(&self) {
        let val = self.counter.fetch_sub(1, Ordering::AcqRel) - 1;
        if val == 0 {
            // we just got the lock, there was no contention
            return;
        }

        let worker = Worker::current();
        WorkerStats::bump(&worker.stats().lock_contention);
        worker::wait_in_mpsc_queue(&self.waiters);
    }

    pub(crate) fn try_lock(&self) -> bool {
        self.counter
            .compare_exchange_weak(1, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the lock and wakes the oldest waiter if there is one.
    /// Returns whether the lock was contended. Also the deferred-unlock
    /// entry point used by condvar and multi-channel waits.
    pub(crate) fn unlock_internal(&self) -> bool {
        // the atomic release below also publishes every write made under
        // the lock to the next locker
        let new_val = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        if new_val != 1 {
            worker::wake_from_mpsc_queue(&self.waiters, 1);
            return true;
        }
        false
    }

    pub(crate) fn unlock(&self) {
        if self.unlock_internal() {
            // the lock was contended - be nice and let the waiter run
            Worker::current().yield_now();
        }
    }
}

/// Mutual exclusion between fibers, guarding a `T`.
///
/// Waiters queue strict-FIFO. Lockers must be fibers; the guard is
/// released on drop (with a courtesy yield if someone was waiting).
pub struct Mutex<T> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

// Safety: standard lock rules.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

// === impl Mutex ===

impl<T> Mutex<T> {
    pub fn new(data: T) -> Self {
        Self {
            raw: RawMutex::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the mutex, parking the calling fiber when contended.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard { mutex: self }
    }

    /// Acquires the mutex only if it is free right now.
    ///
    /// # Errors
    ///
    /// [`Error::WouldBlock`] when the mutex is held.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, Error> {
        if self.raw.try_lock() {
            Ok(MutexGuard { mutex: self })
        } else {
            Err(Error::WouldBlock)
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub(crate) fn raw(&self) -> &RawMutex {
        &self.raw
    }

    /// Restores a guard after a wait that consumed one (condvar).
    pub(crate) fn guard_unchecked(&self) -> MutexGuard<'_, T> {
        MutexGuard { mutex: self }
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}

impl<'a, T> MutexGuard<'a, T> {
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T> std::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // not locking here: Debug must work off-runtime too
        f.debug_struct("Mutex").finish_non_exhaustive()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&**self, f)
    }
}
