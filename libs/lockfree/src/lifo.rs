//! A lock-free multi-producer, multi-consumer LIFO (Treiber stack).
//!
//! The head pointer lives next to a modification counter in an
//! [`AbaCell`], so a popper that raced a pop/push cycle of the same node
//! fails its CAS instead of corrupting the list.
//!
//! Note the classic caveat, inherited deliberately: `try_pop` reads
//! `head->next` *before* winning the CAS, so nodes must not be freed while
//! any thread may still be popping. Users keep nodes alive for the stack's
//! lifetime (e.g. by recycling them through the stack itself).

use crate::loom::sync::atomic::Ordering;
use crate::{AbaCell, Node, Relax};
use alloc::boxed::Box;

pub struct MpmcLifo<T> {
    head: AbaCell<Node<T>>,
}

// === impl MpmcLifo ===

impl<T> MpmcLifo<T> {
    pub const fn new() -> Self {
        Self {
            head: AbaCell::empty(),
        }
    }

    /// Pushes a node; callable from any number of threads.
    pub fn push(&self, node: Box<Node<T>>) {
        let node = Box::into_raw(node);
        let mut relax = Relax::new();
        loop {
            let snapshot = self.head.load(Ordering::Acquire);
            // Safety: exclusive until the CAS publishes the node.
            unsafe { (*node).next.store(snapshot.ptr, Ordering::Relaxed) };
            if self.head.compare_exchange_weak(snapshot, snapshot.with_ptr(node)) {
                return;
            }
            relax.pause();
        }
    }

    /// Pops the most recently pushed node, if any.
    pub fn try_pop(&self) -> Option<Box<Node<T>>> {
        let mut relax = Relax::new();
        loop {
            let snapshot = self.head.load(Ordering::Acquire);
            if snapshot.ptr.is_null() {
                return None;
            }
            // Safety: see the module docs — nodes are kept alive by the
            // user while pops may be in flight, so this read cannot hit
            // freed memory; the counter CAS rejects stale snapshots.
            let next = unsafe { (*snapshot.ptr).next.load(Ordering::Acquire) };
            if self.head.compare_exchange_weak(snapshot, snapshot.with_ptr(next)) {
                // Safety: the CAS transferred ownership to us.
                return Some(unsafe { Box::from_raw(snapshot.ptr) });
            }
            relax.pause();
        }
    }
}

impl<T> Default for MpmcLifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for MpmcLifo<T> {
    fn drop(&mut self) {
        let mut cur = self.head.load_mut().ptr;
        while !cur.is_null() {
            // Safety: exclusive access during drop.
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}

// Safety: the only shared state is the ABA-counted head.
unsafe impl<T: Send> Send for MpmcLifo<T> {}
unsafe impl<T: Send> Sync for MpmcLifo<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn push_pop_single_thread() {
        let lifo = MpmcLifo::new();
        lifo.push(Box::new(Node::new(1)));
        lifo.push(Box::new(Node::new(2)));
        // Safety: node just popped, exclusively owned.
        let popped = unsafe { lifo.try_pop().unwrap().take() };
        assert_eq!(popped, Some(2));
        let popped = unsafe { lifo.try_pop().unwrap().take() };
        assert_eq!(popped, Some(1));
        assert!(lifo.try_pop().is_none());
    }

    #[test]
    fn concurrent_push_pop_conserves_values() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 1_000;

        let lifo = Arc::new(MpmcLifo::new());

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let lifo = lifo.clone();
                std::thread::spawn(move || {
                    let mut popped = Vec::new();
                    for i in 0..PER_THREAD {
                        lifo.push(Box::new(Node::new(t * PER_THREAD + i)));
                        if i % 2 == 0
                            && let Some(node) = lifo.try_pop()
                        {
                            // Safety: exclusively owned after pop.
                            popped.push(unsafe { node.take() }.unwrap());
                        }
                    }
                    popped
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for v in h.join().unwrap() {
                assert!(seen.insert(v));
            }
        }
        while let Some(node) = lifo.try_pop() {
            // Safety: exclusively owned after pop.
            assert!(seen.insert(unsafe { node.take() }.unwrap()));
        }
        assert_eq!(seen.len(), THREADS * PER_THREAD);
    }
}
