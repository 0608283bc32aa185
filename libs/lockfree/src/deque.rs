//! A work-stealing deque.
//!
//! Based on "Dynamic Circular Work-Stealing Deque" by David Chase and Yossi
//! Lev: the owning thread pushes and pops at the *bottom* without
//! synchronisation in the common case; any number of thieves CAS the *top*.
//! The backing array is a power-of-two circle that is transparently
//! replaced with a doubled one when full — replaced arrays stay reachable
//! through a `prev` chain (a thief may still be indexing into one) and are
//! freed when the deque is dropped.
//!
//! Elements must be machine-word sized `Copy` values (the runtime stores
//! fiber pointers); slots are atomic words so concurrent thief reads are
//! well-defined.

use crate::CachePadded;
use crate::loom::sync::atomic::{AtomicI64, AtomicPtr, AtomicUsize, Ordering};
use alloc::boxed::Box;
use core::marker::PhantomData;
use core::mem;
use core::ptr;

/// Outcome of a bottom pop or a steal.
#[derive(Debug, PartialEq, Eq)]
pub enum Steal<T> {
    /// The deque was empty.
    Empty,
    /// Lost a race; the caller may retry or move on.
    Abort,
    Success(T),
}

struct CircularArray<T> {
    size_minus_one: i64,
    /// If non-null, this array was created to transparently grow `prev`.
    /// The chain is destroyed with the deque.
    prev: *mut CircularArray<T>,
    slots: Box<[AtomicUsize]>,
    _marker: PhantomData<T>,
}

impl<T: Copy> CircularArray<T> {
    fn alloc(log_size: u32) -> *mut Self {
        let size = 1_usize << log_size;
        Box::into_raw(Box::new(Self {
            size_minus_one: size as i64 - 1,
            prev: ptr::null_mut(),
            slots: (0..size).map(|_| AtomicUsize::new(0)).collect(),
            _marker: PhantomData,
        }))
    }

    fn log_size(&self) -> u32 {
        (self.size_minus_one + 1).trailing_zeros()
    }

    #[inline]
    fn get(&self, i: i64) -> T {
        let bits = self.slots[(i & self.size_minus_one) as usize].load(Ordering::Relaxed);
        // Safety: `T` is word-sized `Copy` (checked in `new`) and the slot
        // was written by `put` with a valid `T`.
        unsafe { mem::transmute_copy(&bits) }
    }

    #[inline]
    fn put(&self, i: i64, value: T) {
        let mut bits = 0_usize;
        // Safety: `T` is word-sized `Copy` (checked in `new`).
        unsafe { ptr::write(ptr::from_mut(&mut bits).cast::<T>(), value) };
        self.slots[(i & self.size_minus_one) as usize].store(bits, Ordering::Relaxed);
    }

    /// Doubles the array, copying the live `start..end` range; the old
    /// array is chained via `prev`.
    fn grow(old: *mut Self, start: i64, end: i64) -> *mut Self {
        // Safety: only the owner grows, and `old` is live.
        unsafe {
            let new = Self::alloc((*old).log_size() + 1);
            for i in start..end {
                (*new).put(i, (*old).get(i));
            }
            (*new).prev = old;
            new
        }
    }
}

pub struct WorkStealingDeque<T> {
    top: CachePadded<AtomicI64>,
    bottom: CachePadded<AtomicI64>,
    array: CachePadded<AtomicPtr<CircularArray<T>>>,
}

// === impl WorkStealingDeque ===

impl<T: Copy> WorkStealingDeque<T> {
    const INITIAL_LOG_SIZE: u32 = 8;

    pub fn new() -> Self {
        const {
            assert!(mem::size_of::<T>() == mem::size_of::<usize>());
        }
        Self {
            top: CachePadded::new(AtomicI64::new(0)),
            bottom: CachePadded::new(AtomicI64::new(0)),
            array: CachePadded::new(AtomicPtr::new(CircularArray::<T>::alloc(
                Self::INITIAL_LOG_SIZE,
            ))),
        }
    }

    pub fn len(&self) -> usize {
        let size = self.bottom.load(Ordering::Acquire) - self.top.load(Ordering::Acquire);
        usize::try_from(size).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes onto the bottom.
    ///
    /// # Safety
    ///
    /// Owner only: a single thread may push/pop the bottom.
    pub unsafe fn push_bottom(&self, value: T) {
        let b = self.bottom.load(Ordering::Acquire);
        let t = self.top.load(Ordering::Acquire);
        let mut array = self.array.load(Ordering::Acquire);
        // Safety: the array pointer is live; only the owner replaces it.
        unsafe {
            if b - t >= (*array).size_minus_one {
                array = CircularArray::grow(array, t, b);
                self.array.store(array, Ordering::Release);
            }
            (*array).put(b, value);
        }
        self.bottom.store(b + 1, Ordering::Release);
    }

    /// Pops from the bottom.
    ///
    /// # Safety
    ///
    /// Owner only: a single thread may push/pop the bottom.
    pub unsafe fn pop_bottom(&self) -> Steal<T> {
        let b = self.bottom.load(Ordering::Acquire) - 1;
        let array = self.array.load(Ordering::Acquire);
        self.bottom.store(b, Ordering::SeqCst);

        let t = self.top.load(Ordering::SeqCst);
        let size = b - t;
        if size < 0 {
            self.bottom.store(t, Ordering::Release);
            return Steal::Empty;
        }
        // Safety: the array pointer is live.
        let value = unsafe { (*array).get(b) };
        if size > 0 {
            return Steal::Success(value);
        }

        // Last element: race the thieves for it.
        let t_plus_one = t + 1;
        if self
            .top
            .compare_exchange(t, t_plus_one, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            self.bottom.store(t_plus_one, Ordering::Release);
            return Steal::Abort;
        }
        self.bottom.store(t_plus_one, Ordering::Release);
        Steal::Success(value)
    }

    /// Steals from the top; callable from any thread.
    pub fn steal(&self) -> Steal<T> {
        let t = self.top.load(Ordering::Acquire);
        let b = self.bottom.load(Ordering::Acquire);
        let array = self.array.load(Ordering::Acquire);
        if b - t <= 0 {
            return Steal::Empty;
        }
        // Safety: replaced arrays stay alive via the prev chain until the
        // deque is dropped, so this read is in-bounds even if we lose the
        // race below (the value is discarded on Abort).
        let value = unsafe { (*array).get(t) };
        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return Steal::Abort;
        }
        Steal::Success(value)
    }
}

impl<T: Copy> Default for WorkStealingDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for WorkStealingDeque<T> {
    fn drop(&mut self) {
        let mut cur = self.array.load(Ordering::Relaxed);
        while !cur.is_null() {
            // Safety: exclusive access during drop; the chain was built by
            // `grow`.
            let array = unsafe { Box::from_raw(cur) };
            cur = array.prev;
        }
    }
}

// Safety: slots are atomic words and T is Copy; the bottom contract is
// enforced by `unsafe` on the owner-side methods.
unsafe impl<T: Send> Send for WorkStealingDeque<T> {}
unsafe impl<T: Send> Sync for WorkStealingDeque<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering as StdOrdering};

    #[test]
    fn lifo_for_owner() {
        let deque = WorkStealingDeque::<usize>::new();
        // Safety: single thread owns the bottom.
        unsafe {
            for i in 0..100 {
                deque.push_bottom(i);
            }
            for i in (0..100).rev() {
                assert_eq!(deque.pop_bottom(), Steal::Success(i));
            }
            assert_eq!(deque.pop_bottom(), Steal::Empty);
        }
    }

    #[test]
    fn growth_preserves_contents() {
        let deque = WorkStealingDeque::<usize>::new();
        // push enough to force a couple of grows
        // Safety: single thread owns the bottom.
        unsafe {
            for i in 0..2_000 {
                deque.push_bottom(i);
            }
            let mut seen = HashSet::new();
            while let Steal::Success(v) = deque.pop_bottom() {
                assert!(seen.insert(v));
            }
            assert_eq!(seen.len(), 2_000);
        }
    }

    #[test]
    fn owner_and_thieves_see_each_item_once() {
        const TOTAL: usize = 100_000;
        const THIEVES: usize = 3;

        let deque = Arc::new(WorkStealingDeque::<usize>::new());
        let done = Arc::new(AtomicBool::new(false));

        let thieves: Vec<_> = (0..THIEVES)
            .map(|_| {
                let deque = deque.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let mut stolen = Vec::new();
                    loop {
                        match deque.steal() {
                            Steal::Success(v) => stolen.push(v),
                            Steal::Empty if done.load(StdOrdering::Acquire) => break,
                            Steal::Empty | Steal::Abort => std::hint::spin_loop(),
                        }
                    }
                    stolen
                })
            })
            .collect();

        let mut popped = Vec::new();
        // Safety: this thread owns the bottom.
        unsafe {
            for i in 0..TOTAL {
                deque.push_bottom(i);
                if i % 8 == 0 {
                    if let Steal::Success(v) = deque.pop_bottom() {
                        popped.push(v);
                    }
                }
            }
            loop {
                match deque.pop_bottom() {
                    Steal::Success(v) => popped.push(v),
                    Steal::Empty => break,
                    Steal::Abort => {}
                }
            }
        }
        done.store(true, StdOrdering::Release);

        let mut all = HashSet::new();
        for v in popped {
            assert!(all.insert(v), "{v} observed twice");
        }
        for t in thieves {
            for v in t.join().unwrap() {
                assert!(all.insert(v), "{v} observed twice");
            }
        }
        assert_eq!(all.len(), TOTAL);
    }
}
