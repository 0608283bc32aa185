//! Lock-free building blocks for the weft fiber runtime.
//!
//! Everything in this crate is usable on its own, but the shapes are driven
//! by what the runtime needs to suspend and wake fibers without taking
//! locks:
//!
//! - [`SpscFifo`] / [`MpscFifo`] — wait-free linked FIFOs with a resident
//!   sentinel node. Popping rotates node identity: the consumer gets back
//!   the *previous* sentinel carrying the next node's value, so a fixed set
//!   of caller-owned nodes can circulate forever without allocating.
//! - [`MpmcFifo`] — the Ladan-Mozes/Shavit optimistic doubly-linked queue,
//!   with [`hazard`] pointers guarding node reclamation.
//! - [`MpmcLifo`] — a Treiber stack made ABA-safe by an adjacent counter
//!   updated with a double-word compare-and-swap ([`AbaCell`]).
//! - [`DistFifo`] — a "distinguished" FIFO: one wait-free producer, any
//!   number of lock-free consumers popping through a tagged head.
//! - [`WorkStealingDeque`] — the Chase–Lev deque (owner pushes and pops the
//!   bottom, thieves CAS the top) with transparent array growth.
//! - [`RingBuffer`] — a bounded power-of-two ring where slot ownership is
//!   tracked by NULL-ness.

#![cfg_attr(not(any(test, loom)), no_std)]

extern crate alloc;

pub(crate) mod loom;

mod aba;
mod cache_padded;
pub mod deque;
pub mod dist;
pub mod hazard;
pub mod lifo;
pub mod mpmc;
pub mod mpsc;
mod relax;
pub mod ring;
pub mod spsc;

pub use aba::{AbaCell, Tagged};
pub use cache_padded::CachePadded;
pub use relax::Relax;
pub use deque::{Steal, WorkStealingDeque};
pub use dist::{DistFifo, DistPop};
pub use lifo::MpmcLifo;
pub use mpmc::{MpmcFifo, MpmcNode};
pub use mpsc::MpscFifo;
pub use ring::RingBuffer;
pub use spsc::SpscFifo;

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicPtr, Ordering};
use core::ptr;

/// A singly linked queue node carrying one optional value.
///
/// Shared by [`SpscFifo`], [`MpscFifo`], [`DistFifo`] and [`MpmcLifo`].
/// Nodes are allocated by the caller (`Box<Node<T>>`), owned by the queue
/// while enqueued and handed back on pop. Because pops rotate node
/// identity, the node returned is generally *not* the one that carried the
/// value in.
pub struct Node<T> {
    pub(crate) next: AtomicPtr<Node<T>>,
    pub(crate) value: UnsafeCell<Option<T>>,
}

impl<T> Node<T> {
    pub fn new(value: T) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(Some(value)),
        }
    }

    /// An empty node, suitable as a FIFO sentinel or as a fiber's spare
    /// wait node.
    pub fn empty() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(None),
        }
    }

    /// Takes the carried value out of the node.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the node, i.e. it must not
    /// currently be enqueued anywhere.
    pub unsafe fn take(&self) -> Option<T> {
        // Safety: exclusivity ensured by caller
        unsafe { self.value.with_mut(|v| (*v).take()) }
    }

    /// Stores a value into the node, returning the previous one.
    ///
    /// # Safety
    ///
    /// Same exclusivity requirement as [`Node::take`].
    pub unsafe fn put(&self, value: T) -> Option<T> {
        // Safety: exclusivity ensured by caller
        unsafe { self.value.with_mut(|v| (*v).replace(value)) }
    }

    /// The node's link, for callers that weave their own lists out of
    /// queue nodes (e.g. a Treiber stack of waiters).
    pub fn next(&self) -> *mut Node<T> {
        self.next.load(Ordering::Acquire)
    }

    /// Sets the node's link. The node must not be enqueued anywhere the
    /// link is owned by a queue.
    pub fn set_next(&self, next: *mut Node<T>) {
        self.next.store(next, Ordering::Release);
    }
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self::empty()
    }
}

// Safety: a node is just a value slot plus a link; it carries no thread
// affinity of its own.
unsafe impl<T: Send> Send for Node<T> {}
// Safety: concurrent access to `value` is gated by the queue protocols
// (single consumer, or exclusive ownership after pop).
unsafe impl<T: Send> Sync for Node<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(SpscFifo<usize>: Send, Sync);
    assert_impl_all!(MpscFifo<usize>: Send, Sync);
    assert_impl_all!(MpmcFifo<usize>: Send, Sync);
    assert_impl_all!(MpmcLifo<usize>: Send, Sync);
    assert_impl_all!(DistFifo<usize>: Send, Sync);
    assert_impl_all!(WorkStealingDeque<usize>: Send, Sync);
    assert_impl_all!(RingBuffer<usize>: Send, Sync);
    assert_impl_all!(hazard::HazardDomain: Send, Sync);

    #[test]
    fn node_value_roundtrip() {
        let node = Node::new(7_u32);
        // Safety: the node is not enqueued anywhere.
        unsafe {
            assert_eq!(node.take(), Some(7));
            assert_eq!(node.put(8), None);
            assert_eq!(node.take(), Some(8));
        }
    }
}
