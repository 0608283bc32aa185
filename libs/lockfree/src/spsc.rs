//! A wait-free single-producer, single-consumer FIFO.
//!
//! Based on "Writing Lock-Free Code: A Corrected Queue" by Herb Sutter: a
//! singly linked list with a resident sentinel, the consumer reading from
//! `head` and the producer appending at `tail`. Ordering is strict FIFO and
//! both ends are wait-free.

use crate::Node;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::Ordering;
use alloc::boxed::Box;
use core::ptr;

pub struct SpscFifo<T> {
    /// Consumer end. Only ever touched by the single consumer.
    head: UnsafeCell<*mut Node<T>>,
    /// Producer end. Only ever touched by the single producer.
    tail: UnsafeCell<*mut Node<T>>,
}

// === impl SpscFifo ===

impl<T> SpscFifo<T> {
    /// Creates an empty FIFO. Allocates the sentinel node.
    pub fn new() -> Self {
        let sentinel = Box::into_raw(Box::new(Node::empty()));
        Self {
            head: UnsafeCell::new(sentinel),
            tail: UnsafeCell::new(sentinel),
        }
    }

    /// Appends a node. The FIFO owns `node` until it is handed back by
    /// [`SpscFifo::try_pop`].
    ///
    /// # Safety
    ///
    /// Single producer: no other thread may call `push` concurrently.
    pub unsafe fn push(&self, node: Box<Node<T>>) {
        let node = Box::into_raw(node);
        // Safety: we have exclusive producer access per the contract, and
        // the node must be terminated before it becomes visible to the
        // consumer as the new tail.
        unsafe {
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
            self.tail.with_mut(|tail| {
                let prev_tail = *tail;
                *tail = node;
                (*prev_tail).next.store(node, Ordering::Release);
            });
        }
    }

    /// Pops the oldest value. The returned node is owned by the caller and
    /// carries the value; it is the rotated-out previous sentinel, not the
    /// node the value was pushed with.
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
                // Rotate: the value moves from the new head into the node
                // being handed out.
                let value = (*next).value.with_mut(|v| (*v).take());
                (*prev_head).value.with_mut(|v| *v = value);
                *head = next;
                Some(Box::from_raw(prev_head))
            })
        }
    }
}

impl<T> Default for SpscFifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SpscFifo<T> {
    fn drop(&mut self) {
        // Exclusive access: free every remaining node including the
        // sentinel.
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

// Safety: the producer/consumer contract partitions all mutable state.
unsafe impl<T: Send> Send for SpscFifo<T> {}
unsafe impl<T: Send> Sync for SpscFifo<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn strict_fifo_across_threads() {
        crate::loom::model(|| {
            let fifo = Arc::new(SpscFifo::new());

            let producer = {
                let fifo = fifo.clone();
                crate::loom::thread::spawn(move || {
                    for i in 0..64 {
                        // Safety: this thread is the only producer.
                        unsafe { fifo.push(Box::new(Node::new(i))) };
                    }
                })
            };

            let mut seen = Vec::new();
            while seen.len() < 64 {
                // Safety: this thread is the only consumer.
                if let Some(node) = unsafe { fifo.try_pop() } {
                    seen.push(unsafe { node.take() }.unwrap());
                }
            }
            producer.join().unwrap();

            assert_eq!(seen, (0..64).collect::<Vec<_>>());
        });
    }
}
