//! A reader–writer lock for fibers.
//!
//! All lock state lives in one 64-bit word with four packed fields —
//! `write_locked` (1 bit), `reader_count`, `waiting_readers` and
//! `waiting_writers` (21 bits each) — and every transition is a CAS on
//! the whole word, so acquire/release and the waiter bookkeeping are one
//! atomic step.
//!
//! Fairness: a reader will not acquire while a writer holds the lock *or
//! is waiting* (or another reader is already waiting behind a writer),
//! and the unlock handoff prefers writers after a read phase and readers
//! after a write phase, so neither side can starve the other.

use crate::error::Error;
use crate::fiber::FiberRef;
use crate::worker;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use weft_lockfree::MpscFifo;

const WRITE_LOCKED: u64 = 1;
const FIELD_BITS: u32 = 21;
const FIELD_MASK: u64 = (1 << FIELD_BITS) - 1;
const READERS_SHIFT: u32 = 1;
const WAITING_READERS_SHIFT: u32 = 1 + FIELD_BITS;
const WAITING_WRITERS_SHIFT: u32 = 1 + 2 * FIELD_BITS;

/// Unpacked view of the state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct State {
    write_locked: bool,
    readers: u64,
    waiting_readers: u64,
    waiting_writers: u64,
}

impl State {
    #[inline]
    fn unpack(word: u64) -> Self {
        Self {
            write_locked: word & WRITE_LOCKED != 0,
            readers: (word >> READERS_SHIFT) & FIELD_MASK,
            waiting_readers: (word >> WAITING_READERS_SHIFT) & FIELD_MASK,
            waiting_writers: (word >> WAITING_WRITERS_SHIFT) & FIELD_MASK,
        }
    }

    #[inline]
    fn pack(self) -> u64 {
        debug_assert!(self.readers <= FIELD_MASK);
        debug_assert!(self.waiting_readers <= FIELD_MASK);
        debug_assert!(self.waiting_writers <= FIELD_MASK);
        u64::from(self.write_locked)
            | (self.readers << READERS_SHIFT)
            | (self.waiting_readers << WAITING_READERS_SHIFT)
            | (self.waiting_writers << WAITING_WRITERS_SHIFT)
    }
}

struct RawRwLock {
    state: AtomicU64,
    write_waiters: MpscFifo<FiberRef>,
    read_waiters: MpscFifo<FiberRef>,
}

// === impl RawRwLock ===

impl RawRwLock {
    fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            write_waiters: MpscFifo::new(),
            read_waiters: MpscFifo::new(),
        }
    }

    fn read_lock(&self) {
        loop {
            let snapshot = self.state.load(Ordering::Acquire);
            let mut state = State::unpack(snapshot);
            if state.waiting_writers != 0 || state.write_locked || state.waiting_readers != 0 {
                state.waiting_readers += 1;
                if self.cas(snapshot, state) {
                    // write locked, or a writer is queued - be friendly and wait
                    worker::wait_in_mpsc_queue(&self.read_waiters);
                    return;
                }
            } else {
                state.readers += 1;
                if self.cas(snapshot, state) {
                    return;
                }
            }
        }
    }

    fn try_read_lock(&self) -> bool {
        loop {
            let snapshot = self.state.load(Ordering::Acquire);
            let mut state = State::unpack(snapshot);
            if state.waiting_writers != 0 || state.write_locked || state.waiting_readers != 0 {
                return false;
            }
            state.readers += 1;
            if self.cas(snapshot, state) {
                return true;
            }
        }
    }

    fn write_lock(&self) {
        loop {
            let snapshot = self.state.load(Ordering::Acquire);
            let mut state = State::unpack(snapshot);
            if snapshot != 0 {
                state.waiting_writers += 1;
                if self.cas(snapshot, state) {
                    // locked, or someone is queued - be friendly and wait
                    worker::wait_in_mpsc_queue(&self.write_waiters);
                    return;
                }
            } else {
                state.write_locked = true;
                if self.cas(snapshot, state) {
                    return;
                }
            }
        }
    }

    fn try_write_lock(&self) -> bool {
        loop {
            let snapshot = self.state.load(Ordering::Acquire);
            if snapshot != 0 {
                return false;
            }
            let mut state = State::unpack(snapshot);
            state.write_locked = true;
            if self.cas(snapshot, state) {
                return true;
            }
        }
    }

    fn read_unlock(&self) {
        loop {
            let snapshot = self.state.load(Ordering::Acquire);
            let mut state = State::unpack(snapshot);
            debug_assert!(state.readers > 0);
            debug_assert!(!state.write_locked);
            state.readers -= 1;

            if state.readers == 0 {
                // the last reader out is responsible for waking waiters;
                // writers get the lock first so reads cannot starve them
                if state.waiting_writers != 0 {
                    // no fiber acquires while waiting_writers != 0, so the
                    // handoff below cannot be raced
                    state.write_locked = true;
                    state.waiting_writers -= 1;
                    if self.cas(snapshot, state) {
                        worker::wake_from_mpsc_queue(&self.write_waiters, 1);
                        return;
                    }
                    continue;
                }
                if state.waiting_readers != 0 {
                    let woken = state.waiting_readers;
                    state.readers = woken;
                    state.waiting_readers = 0;
                    if self.cas(snapshot, state) {
                        worker::wake_from_mpsc_queue(
                            &self.read_waiters,
                            usize::try_from(woken).unwrap_or(usize::MAX),
                        );
                        return;
                    }
                    continue;
                }
            }
            if self.cas(snapshot, state) {
                return;
            }
        }
    }

    fn write_unlock(&self) {
        loop {
            let snapshot = self.state.load(Ordering::Acquire);
            let mut state = State::unpack(snapshot);
            debug_assert!(state.readers == 0);
            debug_assert!(state.write_locked);
            state.write_locked = false;

            // after a write phase, pending readers get the lock before the
            // next writer unless only writers are queued
            if state.waiting_writers != 0 && state.waiting_readers == 0 {
                state.write_locked = true;
                state.waiting_writers -= 1;
                if self.cas(snapshot, state) {
                    worker::wake_from_mpsc_queue(&self.write_waiters, 1);
                    return;
                }
                continue;
            }
            if state.waiting_readers != 0 {
                let woken = state.waiting_readers;
                state.readers = woken;
                state.waiting_readers = 0;
                if self.cas(snapshot, state) {
                    worker::wake_from_mpsc_queue(
                        &self.read_waiters,
                        usize::try_from(woken).unwrap_or(usize::MAX),
                    );
                    return;
                }
                continue;
            }
            if self.cas(snapshot, state) {
                return;
            }
        }
    }

    #[inline]
    fn cas(&self, snapshot: u64, new: State) -> bool {
        self.state
            .compare_exchange(snapshot, new.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// A fiber reader–writer lock guarding a `T`.
pub struct RwLock<T> {
    raw: RawRwLock,
    data: UnsafeCell<T>,
}

pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

// Safety: standard lock rules (readers share, writer excludes).
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

// === impl RwLock ===

impl<T> RwLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            raw: RawRwLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires shared read access, parking behind writers.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.raw.read_lock();
        RwLockReadGuard { lock: self }
    }

    /// Acquires exclusive write access.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.raw.write_lock();
        RwLockWriteGuard { lock: self }
    }

    /// # Errors
    ///
    /// [`Error::WouldBlock`] when a writer holds or waits for the lock.
    pub fn try_read(&self) -> Result<RwLockReadGuard<'_, T>, Error> {
        if self.raw.try_read_lock() {
            Ok(RwLockReadGuard { lock: self })
        } else {
            Err(Error::WouldBlock)
        }
    }

    /// # Errors
    ///
    /// [`Error::WouldBlock`] unless the lock is completely free.
    pub fn try_write(&self) -> Result<RwLockWriteGuard<'_, T>, Error> {
        if self.raw.try_write_lock() {
            Ok(RwLockWriteGuard { lock: self })
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
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: shared access while read-locked.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.read_unlock();
    }
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: exclusive access while write-locked.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: exclusive access while write-locked.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.write_unlock();
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RwLockReadGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&**self, f)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RwLockWriteGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&**self, f)
    }
}
