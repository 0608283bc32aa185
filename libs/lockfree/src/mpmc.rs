//! A lock-free multi-producer, multi-consumer FIFO.
//!
//! An adaptation of "An Optimistic Approach to Lock-Free FIFO Queues" by
//! Edya Ladan-Mozes and Nir Shavit: nodes are pushed onto `tail` with a CAS
//! and linked *optimistically* — `next` points towards the old tail, and
//! the winning pusher eagerly repairs the popped-from `prev` direction.
//!
//! Poppers traverse `head`/`head->prev` under [`hazard`](crate::hazard)
//! protection (two slots per thread) and retire the dequeued node instead
//! of freeing it, so a concurrent popper holding the same head never reads
//! freed memory.

use crate::hazard::{GcFunction, HazardNode, HazardRecord};
use crate::loom::cell::UnsafeCell;
use crate::CachePadded;
use crate::loom::sync::atomic::{AtomicPtr, Ordering};
use alloc::boxed::Box;
use core::ptr::{self, NonNull};

/// Hazard slots a thread needs to operate an [`MpmcFifo`].
pub const MPMC_HAZARD_COUNT: usize = 2;

/// A queue node. The embedded [`HazardNode`] must stay the first field so
/// that node pointers and hazard pointers coincide.
#[repr(C)]
pub struct MpmcNode<T> {
    hazard: HazardNode,
    value: UnsafeCell<Option<T>>,
    prev: AtomicPtr<MpmcNode<T>>,
    next: AtomicPtr<MpmcNode<T>>,
}

impl<T> MpmcNode<T> {
    pub fn new(gc_function: GcFunction, gc_data: *mut ()) -> Self {
        Self {
            hazard: HazardNode::new(gc_function, gc_data),
            value: UnsafeCell::new(None),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Stores the value to carry. Must happen before the node is pushed.
    pub fn set_value(&mut self, value: T) {
        self.value.with_mut(|v| {
            // Safety: `&mut self` grants exclusive access.
            unsafe { *v = Some(value) };
        });
    }

    #[inline]
    fn hazard_ptr(node: NonNull<Self>) -> NonNull<HazardNode> {
        // repr(C) with `hazard` first: same address.
        node.cast()
    }

    /// Recovers the node pointer from its hazard node (for gc hooks).
    ///
    /// # Safety
    ///
    /// `hazard` must be the hazard node embedded in an `MpmcNode<T>`.
    pub unsafe fn from_hazard(hazard: NonNull<HazardNode>) -> NonNull<Self> {
        hazard.cast()
    }
}

pub struct MpmcFifo<T> {
    /// Consumers pop from `head` (the oldest node acts as a sentinel).
    head: CachePadded<AtomicPtr<MpmcNode<T>>>,
    /// Producers CAS new nodes onto `tail`.
    tail: CachePadded<AtomicPtr<MpmcNode<T>>>,
}

// === impl MpmcFifo ===

impl<T: Copy> MpmcFifo<T> {
    /// Creates an empty FIFO seeded with `initial` as the sentinel.
    pub fn new(initial: Box<MpmcNode<T>>) -> Self {
        let initial = Box::into_raw(initial);
        // Safety: we exclusively own `initial` until it is published below.
        unsafe {
            (*initial).value.with_mut(|v| *v = None);
            (*initial).prev.store(ptr::null_mut(), Ordering::Relaxed);
            (*initial).next.store(ptr::null_mut(), Ordering::Relaxed);
        }
        Self {
            head: CachePadded::new(AtomicPtr::new(initial)),
            tail: CachePadded::new(AtomicPtr::new(initial)),
        }
    }

    /// Appends a node. The FIFO owns it afterwards; it comes back through
    /// the node's gc hook once dequeued *and* proven hazard-free.
    pub fn push(&self, record: &HazardRecord, node: Box<MpmcNode<T>>) {
        let node = Box::into_raw(node);
        // Safety: exclusive until the tail CAS publishes the node.
        unsafe {
            debug_assert!((*node).value.with(|v| (*v).is_some()));
            (*node).prev.store(ptr::null_mut(), Ordering::Relaxed);
        }

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            // Safety: `tail` is non-null (sentinel) and protected below.
            let tail_nn = unsafe { NonNull::new_unchecked(tail) };
            record.using(MpmcNode::hazard_ptr(tail_nn), 0);
            if tail != self.tail.load(Ordering::Acquire) {
                // tail switched while we were 'using' it
                continue;
            }

            // Safety: hazard slot 0 keeps `tail` alive.
            unsafe { (*node).next.store(tail, Ordering::Relaxed) };
            if self
                .tail
                .compare_exchange_weak(tail, node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                // Safety: we won the tail; repairing `prev` is ours to do.
                unsafe { (*tail).prev.store(node, Ordering::Release) };
                record.done_using(0);
                return;
            }
        }
    }

    /// Pops the oldest value, or `None` if the queue looks empty (possibly
    /// just momentarily — an in-flight pusher may not have repaired `prev`
    /// yet; the caller decides whether to retry).
    pub fn try_pop(&self, record: &HazardRecord) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            // Safety: `head` is never null (sentinel).
            let head_nn = unsafe { NonNull::new_unchecked(head) };
            record.using(MpmcNode::hazard_ptr(head_nn), 0);
            if head != self.head.load(Ordering::Acquire) {
                // head switched while we were 'using' it
                continue;
            }

            // Safety: hazard slot 0 keeps `head` alive.
            let prev = unsafe { (*head).prev.load(Ordering::Acquire) };
            let Some(prev_nn) = NonNull::new(prev) else {
                record.done_using(0);
                return None;
            };

            record.using(MpmcNode::hazard_ptr(prev_nn), 1);
            if head != self.head.load(Ordering::Acquire) {
                // head switched while we were 'using' head->prev
                continue;
            }

            // The pushing thread has repaired `prev`, so its value write
            // happened-before our head load.
            // Safety: hazard slot 1 keeps `prev` alive.
            let ret = unsafe { (*prev).value.with(|v| *v) };
            if self
                .head
                .compare_exchange_weak(head, prev, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                record.done_using(0);
                record.done_using(1);
                record.retire(MpmcNode::hazard_ptr(head_nn));
                debug_assert!(ret.is_some());
                return ret;
            }
        }
    }

}

impl<T> Drop for MpmcFifo<T> {
    fn drop(&mut self) {
        // Exclusive access, and nothing still enqueued can be hazardous:
        // free the nodes (sentinel included) outright rather than through
        // their gc hooks, whose environment may already be gone.
        let mut cur = self.head.load(Ordering::Relaxed);
        while let Some(node) = NonNull::new(cur) {
            // Safety: exclusive ownership during drop.
            unsafe {
                cur = (*node.as_ptr()).prev.load(Ordering::Relaxed);
                drop(Box::from_raw(node.as_ptr()));
            }
        }
    }
}

// Safety: all shared state is atomic; values are `Copy` and reclamation is
// fenced by the hazard protocol.
unsafe impl<T: Send + Copy> Send for MpmcFifo<T> {}
unsafe impl<T: Send + Copy> Sync for MpmcFifo<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hazard::HazardDomain;
    use std::collections::HashSet;
    use std::sync::Arc;

    unsafe fn free_node(_data: *mut (), hazard: NonNull<HazardNode>) {
        // Safety: test nodes are plain boxes.
        drop(unsafe { Box::from_raw(MpmcNode::<usize>::from_hazard(hazard).as_ptr()) });
    }

    fn boxed(value: usize) -> Box<MpmcNode<usize>> {
        let mut node = Box::new(MpmcNode::new(free_node, ptr::null_mut()));
        node.set_value(value);
        node
    }

    #[test]
    fn values_cross_threads_exactly_once() {
        const PRODUCERS: usize = 3;
        const PER_PRODUCER: usize = 500;

        let domain = Arc::new(HazardDomain::new());
        let fifo = Arc::new(MpmcFifo::new(Box::new(MpmcNode::new(
            free_node,
            ptr::null_mut(),
        ))));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let fifo = fifo.clone();
                let domain = domain.clone();
                std::thread::spawn(move || {
                    let record = domain.acquire_record(MPMC_HAZARD_COUNT);
                    // Safety: records live until destroy_all.
                    let record = unsafe { record.as_ref() };
                    for i in 0..PER_PRODUCER {
                        fifo.push(record, boxed(p * PER_PRODUCER + i));
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let fifo = fifo.clone();
                let domain = domain.clone();
                std::thread::spawn(move || {
                    let record = domain.acquire_record(MPMC_HAZARD_COUNT);
                    // Safety: records live until destroy_all.
                    let record = unsafe { record.as_ref() };
                    let mut seen = Vec::new();
                    while seen.len() < PRODUCERS * PER_PRODUCER / 2 {
                        if let Some(v) = fifo.try_pop(record) {
                            seen.push(v);
                        }
                    }
                    seen
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        let mut all = HashSet::new();
        for c in consumers {
            for v in c.join().unwrap() {
                assert!(all.insert(v), "value {v} delivered twice");
            }
        }
        assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);

        drop(fifo);
        // Safety: every thread has finished.
        unsafe { Arc::try_unwrap(domain).ok().unwrap().destroy_all() };
    }
}
