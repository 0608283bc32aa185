//! A "distinguished" FIFO.
//!
//! One distinguished thread pushes in a wait-free manner (plain tail
//! append, no atomics beyond the publishing store); any number of threads
//! pop concurrently through an ABA-counted head. This is the queue behind
//! the distributed-FIFO scheduler variant: the owning worker schedules
//! wait-free while peers steal lock-free.
//!
//! Like [`MpmcLifo`](crate::MpmcLifo), poppers read fields of a node they
//! have not yet won, so nodes must stay allocated while any pop may be in
//! flight — users recycle nodes rather than freeing them mid-use.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::Ordering;
use crate::{AbaCell, CachePadded, Node};
use alloc::boxed::Box;

/// Outcome of [`DistFifo::try_pop`].
pub enum DistPop<T> {
    /// Nothing to pop (possibly only momentarily).
    Empty,
    /// Lost a race with another popper; try again.
    Retry,
    /// A node, rotated out sentinel-style, carrying the oldest value.
    Node(Box<Node<T>>),
}

pub struct DistFifo<T> {
    /// Poppers advance `head` with a counted CAS.
    head: CachePadded<AbaCell<Node<T>>>,
    /// Owned by the single distinguished producer.
    tail: CachePadded<UnsafeCell<*mut Node<T>>>,
}

// === impl DistFifo ===

impl<T: Copy> DistFifo<T> {
    /// Creates an empty FIFO. Allocates the sentinel node.
    pub fn new() -> Self {
        let sentinel = Box::into_raw(Box::new(Node::empty()));
        Self {
            head: CachePadded::new(AbaCell::new(sentinel)),
            tail: CachePadded::new(UnsafeCell::new(sentinel)),
        }
    }

    /// Appends a node; wait-free.
    ///
    /// # Safety
    ///
    /// Only the distinguished producer thread may call this.
    pub unsafe fn push(&self, node: Box<Node<T>>) {
        let node = Box::into_raw(node);
        // Safety: exclusive producer access per the contract; the node is
        // terminated before the Release store makes it visible.
        unsafe {
            (*node).next.store(core::ptr::null_mut(), Ordering::Relaxed);
            self.tail.with_mut(|tail| {
                (**tail).next.store(node, Ordering::Release);
                *tail = node;
            });
        }
    }

    /// Attempts to pop the oldest value; callable from any thread.
    pub fn try_pop(&self) -> DistPop<T> {
        // The snapshot reads counter and pointer as one atomic unit, which
        // is what makes advancing `head` ABA-safe.
        let snapshot = self.head.load(Ordering::Acquire);
        let prev_head = snapshot.ptr;

        // Safety: nodes are never freed while pops may be in flight (see
        // the module docs); a stale read is rejected by the CAS below.
        unsafe {
            let next = (*prev_head).next.load(Ordering::Acquire);
            if next.is_null() {
                return DistPop::Empty;
            }
            let value = (*next).value.with(|v| *v);
            if !self.head.compare_exchange_weak(snapshot, snapshot.with_ptr(next)) {
                return DistPop::Retry;
            }
            (*prev_head).value.with_mut(|v| *v = value);
            DistPop::Node(Box::from_raw(prev_head))
        }
    }
}

impl<T: Copy> Default for DistFifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for DistFifo<T> {
    fn drop(&mut self) {
        let mut cur = self.head.load_mut().ptr;
        while !cur.is_null() {
            // Safety: exclusive access during drop.
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}

// Safety: `tail` belongs to the single producer per the `push` contract;
// everything else is atomic.
unsafe impl<T: Send> Send for DistFifo<T> {}
unsafe impl<T: Send> Sync for DistFifo<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn one_producer_many_thieves() {
        const TOTAL: usize = 4_000;

        let fifo = Arc::new(DistFifo::new());

        let thieves: Vec<_> = (0..3)
            .map(|_| {
                let fifo = fifo.clone();
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    loop {
                        match fifo.try_pop() {
                            DistPop::Node(node) => {
                                // Safety: exclusively owned after pop.
                                let v: usize = unsafe { node.take() }.unwrap();
                                if v == usize::MAX {
                                    break;
                                }
                                seen.push(v);
                            }
                            DistPop::Empty | DistPop::Retry => std::hint::spin_loop(),
                        }
                    }
                    seen
                })
            })
            .collect();

        for i in 0..TOTAL {
            // Safety: this thread is the distinguished producer.
            unsafe { fifo.push(Box::new(Node::new(i))) };
        }
        // one stop marker per thief
        for _ in 0..3 {
            // Safety: this thread is the distinguished producer.
            unsafe { fifo.push(Box::new(Node::new(usize::MAX))) };
        }

        let mut all = HashSet::new();
        for t in thieves {
            for v in t.join().unwrap() {
                assert!(all.insert(v), "value {v} popped twice");
            }
        }
        assert_eq!(all.len(), TOTAL);
    }
}
