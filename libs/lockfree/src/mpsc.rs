//! A wait-free multi-producer, single-consumer FIFO.
//!
//! The same sentinel-rotation scheme as [`SpscFifo`](crate::SpscFifo), but
//! the tail is claimed with an atomic exchange so any number of producers
//! may append. Between a producer's exchange and its store of the previous
//! tail's `next` pointer the list is briefly "not yet stitched"; the
//! consumer observes that window as empty and must retry.
//!
//! Completed pushes are dequeued in strict global FIFO order.

use crate::Node;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicPtr, Ordering};
use alloc::boxed::Box;
use core::ptr;

pub struct MpscFifo<T> {
    /// Consumer end. Only ever touched by the single consumer.
    head: UnsafeCell<*mut Node<T>>,
    /// Producer end, claimed by exchange.
    tail: AtomicPtr<Node<T>>,
}

// === impl MpscFifo ===

impl<T> MpscFifo<T> {
    /// Creates an empty FIFO. Allocates the sentinel node.
    pub fn new() -> Self {
        let sentinel = Box::into_raw(Box::new(Node::empty()));
        Self {
            head: UnsafeCell::new(sentinel),
            tail: AtomicPtr::new(sentinel),
        }
    }

    /// Appends a node; wait-free, callable from any number of threads. The
    /// FIFO owns `node` until it is handed back by [`MpscFifo::try_pop`].
    pub fn push(&self, node: Box<Node<T>>) {
        let node = Box::into_raw(node);
        // Safety: the node must be terminated before it's visible to the
        // consumer as the new tail.
        unsafe {
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
            let prev_tail = self.tail.swap(node, Ordering::AcqRel);
            (*prev_tail).next.store(node, Ordering::Release);
        }
    }

    /// Pops the oldest stitched value, rotating out the previous sentinel.
    ///
    /// Returns `None` both when the queue is empty and when a producer has
    /// exchanged the tail but not yet stitched `next` — callers that know a
    /// value is coming retry.
    ///
    /// # Safety
    ///
    /// Single consumer: no other thread may call `try_pop` concurrently.
    pub unsafe fn try_pop(&self) -> Option<Box<Node<T>>> {
        // Safety: exclusive consumer access per the contract.
        unsafe {
            self.head.with_mut(|head| {
                let prev_head = *head;
                let next = (*prev_head).next.load(Ordering::Acquire);
                if next.is_null() {
                    return None;
                }
                let value = (*next).value.with_mut(|v| (*v).take());
                (*prev_head).value.with_mut(|v| *v = value);
                *head = next;
                Some(Box::from_raw(prev_head))
            })
        }
    }
}

impl<T> Default for MpscFifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for MpscFifo<T> {
    fn drop(&mut self) {
        self.head.with_mut(|head| {
            let mut cur = unsafe { *head };
            while !cur.is_null() {
                // Safety: nodes past `head` are owned by the queue.
                let node = unsafe { Box::from_raw(cur) };
                cur = node.next.load(Ordering::Relaxed);
            }
        });
    }
}

// Safety: producers only touch `tail` (atomic); `head` belongs to the
// single consumer per the `try_pop` contract.
unsafe impl<T: Send> Send for MpscFifo<T> {}
unsafe impl<T: Send> Sync for MpscFifo<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn per_producer_order_is_preserved() {
        crate::loom::model(|| {
            const PER_PRODUCER: u32 = 32;
            let fifo = Arc::new(MpscFifo::new());

            let producers: Vec<_> = (0..2_u32)
                .map(|p| {
                    let fifo = fifo.clone();
                    crate::loom::thread::spawn(move || {
                        for i in 0..PER_PRODUCER {
                            fifo.push(Box::new(Node::new((p, i))));
                        }
                    })
                })
                .collect();

            let mut last_seen = [None::<u32>; 2];
            let mut popped = 0;
            while popped < 2 * PER_PRODUCER {
                // Safety: this thread is the only consumer.
                let Some(node) = (unsafe { fifo.try_pop() }) else {
                    continue;
                };
                let (p, i) = unsafe { node.take() }.unwrap();
                // each producer's stream must arrive in order
                if let Some(prev) = last_seen[p as usize] {
                    assert!(i > prev, "producer {p} reordered: {prev} then {i}");
                }
                last_seen[p as usize] = Some(i);
                popped += 1;
            }

            for p in producers {
                p.join().unwrap();
            }
        });
    }
}
