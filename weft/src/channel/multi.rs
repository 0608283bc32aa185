//! The many-to-many channel.

use crate::fiber::{Fiber, FiberRef, FiberState};
use crate::sync::{Mutex, MutexGuard};
use crate::worker::{Deferred, Worker};
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

struct MultiInner<T> {
    high: u64,
    low: u64,
    /// Blocked senders and receivers, threaded through their scratch
    /// slots. Guarded by the channel mutex.
    waiters: *mut Fiber,
    slots: Box<[*mut T]>,
}

/// A bounded channel with many senders *and* many receivers.
///
/// Unlike [`BoundedChannel`](crate::channel::BoundedChannel) the ring is
/// guarded by a fiber [`Mutex`], and both full senders and empty
/// receivers park on the channel's own waiter list; whoever makes space
/// or data wakes the next waiter. The mutex's deferred unlock means a
/// parked fiber is only observable once it has fully left its stack.
pub struct MultiChannel<T> {
    mask: u64,
    inner: Mutex<MultiInner<T>>,
}

// Safety: the raw message and waiter pointers are guarded by the mutex.
unsafe impl<T: Send> Send for MultiChannel<T> {}
unsafe impl<T: Send> Sync for MultiChannel<T> {}

// === impl MultiChannel ===

impl<T: Send> MultiChannel<T> {
    /// A channel with `2^power_of_2_size` slots.
    ///
    /// # Panics
    ///
    /// Panics if `power_of_2_size` is 0 or ≥ 32.
    pub fn new(power_of_2_size: u32) -> Self {
        assert!(power_of_2_size > 0 && power_of_2_size < 32);
        let size = 1_u64 << power_of_2_size;
        Self {
            mask: size - 1,
            inner: Mutex::new(MultiInner {
                high: 0,
                low: 0,
                waiters: ptr::null_mut(),
                slots: (0..size).map(|_| ptr::null_mut()).collect(),
            }),
        }
    }

    /// Sends a message, parking while the ring is full.
    pub fn send(&self, message: T) {
        let message = Box::into_raw(Box::new(message));
        let mut guard = self.inner.lock();
        while guard.high - guard.low >= self.slots_len() {
            Self::park(guard);
            guard = self.inner.lock();
        }
        let index = (guard.high & self.mask) as usize;
        guard.slots[index] = message;
        guard.high += 1;
        Self::wake_locked(&mut guard);
        // guard drop unlocks (yielding to a woken waiter if contended)
    }

    /// Receives the oldest message, parking while the ring is empty.
    pub fn recv(&self) -> T {
        let mut guard = self.inner.lock();
        while guard.high == guard.low {
            Self::park(guard);
            guard = self.inner.lock();
        }
        let index = (guard.low & self.mask) as usize;
        let message = mem::replace(&mut guard.slots[index], ptr::null_mut());
        guard.low += 1;
        Self::wake_locked(&mut guard);
        drop(guard);
        // Safety: the slot handed over sole ownership of the box.
        *unsafe { Box::from_raw(message) }
    }

    fn slots_len(&self) -> u64 {
        self.mask + 1
    }

    /// Parks the calling fiber on the channel's waiter list, releasing
    /// the mutex once it is off its stack. The caller re-locks.
    fn park(mut guard: MutexGuard<'_, MultiInner<T>>) {
        let worker = Worker::current();
        let fiber = worker.current_fiber();
        // Safety: `fiber` is the running fiber.
        let f = unsafe { fiber.as_ref() };

        // thread ourselves onto the waiter list through scratch
        f.scratch.store(guard.waiters.cast(), Ordering::Relaxed);
        guard.waiters = fiber.as_ptr();

        debug_assert_eq!(f.state(), FiberState::Running);
        f.set_state(FiberState::Waiting);
        worker.set_deferred(Deferred::UnlockMutex(NonNull::from(guard.mutex().raw())));
        // the deferred slot owns the unlock now
        mem::forget(guard);
        worker.yield_now();
    }

    /// Pops and wakes the most recent waiter, if any. Caller holds the
    /// mutex, so the waiter has fully left its stack.
    fn wake_locked(guard: &mut MutexGuard<'_, MultiInner<T>>) {
        if guard.waiters.is_null() {
            return;
        }
        // Safety: parked fibers stay allocated until woken.
        let fiber = unsafe { FiberRef::new_unchecked(guard.waiters) };
        let f = unsafe { fiber.as_ref() };
        guard.waiters = f.scratch.load(Ordering::Relaxed).cast();
        f.scratch.store(ptr::null_mut(), Ordering::Relaxed);
        f.set_state(FiberState::Ready);
        Worker::current().schedule(fiber);
    }
}

impl<T> Drop for MultiChannel<T> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for index in inner.low..inner.high {
            let slot = &mut inner.slots[(index & self.mask) as usize];
            let message = mem::replace(slot, ptr::null_mut());
            if !message.is_null() {
                // Safety: exclusive access during drop.
                drop(unsafe { Box::from_raw(message) });
            }
        }
    }
}
