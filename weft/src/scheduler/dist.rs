//! The distributed-FIFO scheduler.
//!
//! Each worker owns one distinguished FIFO: the owner schedules with a
//! wait-free push of the fiber's own wait node, while thieves (and the
//! owner's `next`) pop through the ABA-counted head. `next` is wait-free
//! when uncontended and retries internally when a pop loses a race.

use crate::fiber::{FiberRef, FiberState};
use std::sync::atomic::{AtomicU64, Ordering};
use weft_lockfree::{DistFifo, DistPop, Relax};

/// Most fibers a single `load_balance` call will move.
const MAX_STEAL: usize = 16;

pub(crate) struct Scheduler {
    id: usize,
    queue: DistFifo<FiberRef>,
    steals: AtomicU64,
    failed_steals: AtomicU64,
}

// === impl Scheduler ===

impl Scheduler {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            queue: DistFifo::new(),
            steals: AtomicU64::new(0),
            failed_steals: AtomicU64::new(0),
        }
    }

    /// Enqueues a Ready fiber, parking it on its own wait node.
    ///
    /// # Safety
    ///
    /// Owning worker only (the FIFO's push side is single-producer).
    pub(crate) unsafe fn schedule(&self, fiber: FiberRef) {
        // Safety: queued fibers stay allocated.
        let node = unsafe { fiber.as_ref() }.take_wait_node();
        // Safety: the node was just detached, exclusively ours.
        unsafe { node.put(fiber) };
        // Safety: owner per the contract.
        unsafe { self.queue.push(node) };
    }

    /// Pops the next runnable fiber, re-queuing any still saving state.
    ///
    /// # Safety
    ///
    /// Owning worker only (re-queues push onto the own FIFO).
    pub(crate) unsafe fn next(&self) -> Option<FiberRef> {
        let mut relax = Relax::new();
        loop {
            let node = loop {
                match self.queue.try_pop() {
                    DistPop::Node(node) => break node,
                    DistPop::Empty => return None,
                    DistPop::Retry => relax.pause(),
                }
            };
            // Safety: the popped node is exclusively ours.
            let fiber = unsafe { node.take() }.expect("scheduled node without fiber");
            // Safety: queued fibers stay allocated.
            if unsafe { fiber.as_ref() }.state() == FiberState::SavingStateToWait {
                // woken before it finished suspending; cycle it to the back
                // Safety: re-stash then owner-push, same as schedule().
                unsafe {
                    node.put(fiber);
                    self.queue.push(node);
                }
            } else {
                // Safety: queued fibers stay allocated.
                unsafe { fiber.as_ref() }.restore_wait_node(node);
                return Some(fiber);
            }
        }
    }

    /// Steals a bounded batch from peers, round-robin from `id + 1`.
    ///
    /// # Safety
    ///
    /// Owning worker only (stolen fibers are pushed onto the own FIFO).
    pub(crate) unsafe fn load_balance(&self, peers: &[Scheduler]) {
        let mut max_steal = MAX_STEAL;

        for i in 1..peers.len() {
            let peer = &peers[(self.id + i) % peers.len()];
            debug_assert!(!std::ptr::eq(peer, self));

            while max_steal > 0 {
                match peer.queue.try_pop() {
                    DistPop::Node(node) => {
                        // Safety: owner-push of our own queue; the node
                        // already carries its fiber.
                        unsafe { self.queue.push(node) };
                        max_steal -= 1;
                        self.steals.fetch_add(1, Ordering::Relaxed);
                    }
                    DistPop::Empty | DistPop::Retry => {
                        self.failed_steals.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
            }
        }
    }

    pub(crate) fn steal_counts(&self) -> (u64, u64) {
        (
            self.steals.load(Ordering::Relaxed),
            self.failed_steals.load(Ordering::Relaxed),
        )
    }
}
