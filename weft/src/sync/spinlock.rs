//! A ticket spinlock.
//!
//! Based on the ticket lock from <http://locklessinc.com/articles/locks/>:
//! lockers take a ticket from the high half of one 64-bit word and spin
//! until the serving counter in the low half reaches it. FIFO-fair and
//! tiny; used where a fiber cannot (or must not) context-switch, e.g.
//! inside the event bridge while its fd tables are being mutated.

use crate::stats::WorkerStats;
use crate::worker::Worker;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

/// One waiting ticket in the high half.
const USER_ONE: u64 = 1 << 32;

#[inline]
fn serving(state: u64) -> u32 {
    state as u32
}

#[inline]
fn next_ticket(state: u64) -> u32 {
    (state >> 32) as u32
}

pub(crate) struct RawSpinLock {
    /// low 32 bits: ticket currently served; high 32 bits: next ticket.
    state: AtomicU64,
}

// === impl RawSpinLock ===

impl RawSpinLock {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
        }
    }

    pub(crate) fn lock(&self) {
        let my_ticket = next_ticket(self.state.fetch_add(USER_ONE, Ordering::Acquire));
        while serving(self.state.load(Ordering::Acquire)) != my_ticket {
            core::hint::spin_loop();
            if let Some(worker) = Worker::try_current() {
                WorkerStats::bump(&worker.stats().spins);
            }
        }
    }

    pub(crate) fn try_lock(&self) -> bool {
        let state = self.state.load(Ordering::Acquire);
        if serving(state) != next_ticket(state) {
            return false;
        }
        self.state
            .compare_exchange_weak(
                state,
                state.wrapping_add(USER_ONE),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub(crate) fn unlock(&self) {
        // Only the holder advances the serving half; the CAS loop is
        // because ticket takers bump the other half of the same word.
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            let new = (state & !0xffff_ffff) | u64::from(serving(state).wrapping_add(1));
            match self.state.compare_exchange_weak(
                state,
                new,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => state = actual,
            }
        }
    }
}

/// Data guarded by a [`RawSpinLock`].
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

// Safety: standard lock rules.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

// === impl SpinLock ===

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.raw.try_lock().then(|| SpinLockGuard { lock: self })
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for SpinLockGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&**self, f)
    }
}
