//! The bounded channel.

use crate::fiber::yield_now;
use crate::sync::Signal;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use weft_lockfree::CachePadded;

/// A bounded channel over a power-of-two ring of message slots.
///
/// Many fibers may send; exactly **one** fiber may receive (the optional
/// wake-up [`Signal`] has a single waiter slot). Senders spin — yielding
/// between attempts — while the ring is full; the receiver blocks on the
/// signal, or busy-yields on an unsignalled channel.
///
/// `high - low` never exceeds the capacity, and committed sends are
/// received in strict FIFO order.
pub struct BoundedChannel<T> {
    // separate cache lines for high and low help senders and the receiver
    // stay out of each other's way
    high: CachePadded<AtomicU64>,
    low: CachePadded<AtomicU64>,
    mask: u64,
    ready_signal: Option<Arc<Signal>>,
    slots: Box<[AtomicPtr<T>]>,
}

// Safety: messages are boxed and handed over through atomic slots.
unsafe impl<T: Send> Send for BoundedChannel<T> {}
unsafe impl<T: Send> Sync for BoundedChannel<T> {}

// === impl BoundedChannel ===

impl<T: Send> BoundedChannel<T> {
    /// A channel with `2^power_of_2_size` slots that busy-yields instead
    /// of sleeping.
    ///
    /// # Panics
    ///
    /// Panics if `power_of_2_size` is 0 or ≥ 32.
    pub fn new(power_of_2_size: u32) -> Self {
        Self::build(power_of_2_size, None)
    }

    /// A channel whose receiver sleeps on `signal`. The signal may be
    /// shared with other channels through a
    /// [`Selector`](crate::channel::Selector).
    pub fn with_signal(power_of_2_size: u32, signal: Arc<Signal>) -> Self {
        Self::build(power_of_2_size, Some(signal))
    }

    fn build(power_of_2_size: u32, ready_signal: Option<Arc<Signal>>) -> Self {
        assert!(power_of_2_size > 0 && power_of_2_size < 32);
        let size = 1_u64 << power_of_2_size;
        Self {
            high: CachePadded::new(AtomicU64::new(0)),
            low: CachePadded::new(AtomicU64::new(0)),
            mask: size - 1,
            ready_signal,
            slots: (0..size).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Sends a message, spinning (with yields) while the ring is full.
    /// Returns whether the receiver was woken.
    pub fn send(&self, message: T) -> bool {
        // a NULL slot means "not written yet", so messages live behind a
        // non-null box pointer
        let message = Box::into_raw(Box::new(message));
        loop {
            // read low first; the buffer appears larger or equal to its
            // actual size
            let low = self.low.load(Ordering::Acquire);
            let high = self.high.load(Ordering::Acquire);
            let index = (high & self.mask) as usize;

            if self.slots[index].load(Ordering::Acquire).is_null()
                && high.wrapping_sub(low) < self.slots.len() as u64
                && self
                    .high
                    .compare_exchange_weak(high, high + 1, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
            {
                self.slots[index].store(message, Ordering::Release);
                if let Some(signal) = &self.ready_signal {
                    return signal.raise();
                }
                return false;
            }
            yield_now();
        }
    }

    /// Receives the oldest message, blocking until one arrives.
    pub fn recv(&self) -> T {
        loop {
            if let Some(message) = self.try_recv() {
                return message;
            }
            if let Some(signal) = &self.ready_signal {
                signal.wait();
            } else {
                yield_now();
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<T> {
        // read high first; the buffer appears smaller or equal to its
        // actual size
        let high = self.high.load(Ordering::Acquire);
        let low = self.low.load(Ordering::Acquire);
        let index = (low & self.mask) as usize;

        if high > low {
            let message = self.slots[index].swap(ptr::null_mut(), Ordering::AcqRel);
            if !message.is_null() {
                self.low.store(low + 1, Ordering::Release);
                // Safety: the swap took sole ownership of the box.
                return Some(*unsafe { Box::from_raw(message) });
            }
        }
        None
    }

    pub(crate) fn signal_ptr(&self) -> Option<*const Signal> {
        self.ready_signal.as_deref().map(ptr::from_ref)
    }
}

impl<T> Drop for BoundedChannel<T> {
    fn drop(&mut self) {
        for slot in &self.slots {
            let message = slot.swap(ptr::null_mut(), Ordering::Relaxed);
            if !message.is_null() {
                // Safety: exclusive access during drop.
                drop(unsafe { Box::from_raw(message) });
            }
        }
    }
}
