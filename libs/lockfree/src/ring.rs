//! A bounded lock-free ring buffer of pointers.
//!
//! A power-of-two slot array where a NULL slot means "not yet written":
//! producers CAS-bump `high` and then write their slot, consumers
//! store-release `low` after clearing theirs. The NULL check prevents a
//! consumer from reading a slot whose producer won the index race but has
//! not stored yet.

use crate::CachePadded;
use crate::loom::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use alloc::boxed::Box;
use core::ptr::NonNull;

pub struct RingBuffer<T> {
    // high and low are generally used together; no point in separating
    // them further than their own lines
    high: CachePadded<AtomicU64>,
    low: CachePadded<AtomicU64>,
    mask: u64,
    slots: Box<[AtomicPtr<T>]>,
}

// === impl RingBuffer ===

impl<T> RingBuffer<T> {
    /// Creates a ring with `2^power_of_2_size` slots.
    ///
    /// # Panics
    ///
    /// Panics if `power_of_2_size` is 0 or ≥ 32.
    pub fn new(power_of_2_size: u32) -> Self {
        assert!(power_of_2_size > 0 && power_of_2_size < 32);
        let size = 1_u64 << power_of_2_size;
        Self {
            high: CachePadded::new(AtomicU64::new(0)),
            low: CachePadded::new(AtomicU64::new(0)),
            mask: size - 1,
            slots: (0..size)
                .map(|_| AtomicPtr::new(core::ptr::null_mut()))
                .collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// A snapshot of the occupancy; reads `high` first so the result never
    /// exceeds the true size.
    pub fn len(&self) -> usize {
        let high = self.high.load(Ordering::Acquire);
        let low = self.low.load(Ordering::Acquire);
        usize::try_from(high.saturating_sub(low)).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempts to push; hands the pointer back if the ring is full (or a
    /// racing producer claimed the slot first — callers loop if they must).
    pub fn try_push(&self, value: NonNull<T>) -> Result<(), NonNull<T>> {
        // read low first; the buffer appears larger or equal to its
        // actual size, so a full-looking ring really is full
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
            self.slots[index].store(value.as_ptr(), Ordering::Release);
            return Ok(());
        }
        Err(value)
    }

    /// Attempts to pop the oldest pointer.
    pub fn try_pop(&self) -> Option<NonNull<T>> {
        // read high first; the buffer appears smaller or equal to its
        // actual size, so an empty-looking ring really is empty
        let high = self.high.load(Ordering::Acquire);
        let low = self.low.load(Ordering::Acquire);
        let index = (low & self.mask) as usize;

        let value = self.slots[index].load(Ordering::Acquire);
        if !value.is_null()
            && high > low
            && self
                .low
                .compare_exchange_weak(low, low + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            self.slots[index].store(core::ptr::null_mut(), Ordering::Release);
            // Safety: checked non-null above; only this thread won the slot.
            return Some(unsafe { NonNull::new_unchecked(value) });
        }
        None
    }
}

// Safety: all shared state is atomic; the pointed-to data's thread safety
// is the caller's concern (we only move pointers).
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64 as StdAtomicU64, Ordering as StdOrdering};

    fn leak(v: u64) -> NonNull<u64> {
        NonNull::from(Box::leak(Box::new(v)))
    }

    unsafe fn unleak(p: NonNull<u64>) -> u64 {
        *unsafe { Box::from_raw(p.as_ptr()) }
    }

    #[test]
    fn bound_is_respected() {
        let ring = RingBuffer::<u64>::new(2);
        for i in 0..4 {
            ring.try_push(leak(i)).unwrap();
        }
        // full now
        let extra = leak(99);
        let back = ring.try_push(extra).unwrap_err();
        // Safety: push rejected, we still own it.
        assert_eq!(unsafe { unleak(back) }, 99);

        for i in 0..4 {
            // Safety: popped pointers are exclusively owned.
            assert_eq!(unsafe { unleak(ring.try_pop().unwrap()) }, i);
        }
        assert!(ring.try_pop().is_none());
    }

    #[test]
    fn concurrent_high_low_invariant() {
        const OPS: u64 = 10_000;
        let ring = Arc::new(RingBuffer::<u64>::new(4));
        let sum = Arc::new(StdAtomicU64::new(0));

        let producers: Vec<_> = (0..2)
            .map(|p| {
                let ring = ring.clone();
                std::thread::spawn(move || {
                    for i in 0..OPS {
                        let mut v = leak(p * OPS + i);
                        loop {
                            assert!(ring.len() <= ring.capacity());
                            match ring.try_push(v) {
                                Ok(()) => break,
                                Err(back) => v = back,
                            }
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let ring = ring.clone();
                let sum = sum.clone();
                std::thread::spawn(move || {
                    let mut got = 0;
                    while got < OPS {
                        if let Some(p) = ring.try_pop() {
                            // Safety: exclusively owned after pop.
                            sum.fetch_add(unsafe { unleak(p) }, StdOrdering::Relaxed);
                            got += 1;
                        }
                    }
                })
            })
            .collect();

        for h in producers.into_iter().chain(consumers) {
            h.join().unwrap();
        }

        let expected: u64 = (0..OPS).sum::<u64>() + (OPS..2 * OPS).sum::<u64>();
        assert_eq!(sum.load(StdOrdering::Relaxed), expected);
    }
}
