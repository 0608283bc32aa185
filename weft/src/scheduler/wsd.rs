//! The work-stealing-deque scheduler.
//!
//! Each worker owns *two* Chase–Lev deques in a double buffer: one is
//! scheduled from, the other stores re-queued `SavingStateToWait` fibers.
//! When the schedule-from side drains the roles swap — which is what
//! keeps a saving fiber from being popped in a tight loop before its
//! worker commits it to Waiting. Thieves take from the top of both deques
//! of a victim.

use crate::fiber::{FiberRef, FiberState};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use weft_lockfree::{Steal, WorkStealingDeque};

/// Most fibers a single `load_balance` call will move.
const MAX_STEAL: usize = 50;

pub(crate) struct Scheduler {
    id: usize,
    queues: [WorkStealingDeque<FiberRef>; 2],
    /// Index of the schedule-from deque; the other one is store-to. Only
    /// the owning worker reads or writes this.
    active: AtomicUsize,
    steals: AtomicU64,
    failed_steals: AtomicU64,
}

// === impl Scheduler ===

impl Scheduler {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            queues: [WorkStealingDeque::new(), WorkStealingDeque::new()],
            active: AtomicUsize::new(0),
            steals: AtomicU64::new(0),
            failed_steals: AtomicU64::new(0),
        }
    }

    #[inline]
    fn schedule_from(&self) -> &WorkStealingDeque<FiberRef> {
        &self.queues[self.active.load(Ordering::Relaxed)]
    }

    #[inline]
    fn store_to(&self) -> &WorkStealingDeque<FiberRef> {
        &self.queues[self.active.load(Ordering::Relaxed) ^ 1]
    }

    /// Enqueues a Ready fiber.
    ///
    /// # Safety
    ///
    /// Owning worker only (deque bottom is single-owner).
    pub(crate) unsafe fn schedule(&self, fiber: FiberRef) {
        // Safety: owner per the contract.
        unsafe { self.schedule_from().push_bottom(fiber) };
    }

    /// Pops the next runnable fiber, re-queuing any still saving state.
    ///
    /// # Safety
    ///
    /// Owning worker only.
    pub(crate) unsafe fn next(&self) -> Option<FiberRef> {
        if self.schedule_from().is_empty() {
            self.active.fetch_xor(1, Ordering::Relaxed);
        }

        while !self.schedule_from().is_empty() {
            // Safety: owner per the contract.
            match unsafe { self.schedule_from().pop_bottom() } {
                Steal::Success(fiber) => {
                    // Safety: queued fibers stay allocated.
                    if unsafe { fiber.as_ref() }.state() == FiberState::SavingStateToWait {
                        // woken before it finished suspending; park it on
                        // the other deque until its worker commits it
                        // Safety: owner per the contract.
                        unsafe { self.store_to().push_bottom(fiber) };
                    } else {
                        return Some(fiber);
                    }
                }
                Steal::Empty | Steal::Abort => {}
            }
        }
        None
    }

    /// Steals a bounded batch from longer peer queues, round-robin from
    /// `id + 1`.
    ///
    /// # Safety
    ///
    /// Owning worker only (pushes stolen fibers onto the own bottom).
    pub(crate) unsafe fn load_balance(&self, peers: &[Scheduler]) {
        let mut max_steal = MAX_STEAL;
        let mut local_count = self.schedule_from().len();

        for i in 1..peers.len() {
            let peer = &peers[(self.id + i) % peers.len()];
            debug_assert!(!std::ptr::eq(peer, self));

            for queue in &peer.queues {
                let mut remote_count = queue.len();
                while remote_count > local_count && max_steal > 0 {
                    match queue.steal() {
                        Steal::Success(fiber) => {
                            // Safety: owner per the contract.
                            unsafe { self.schedule_from().push_bottom(fiber) };
                            remote_count -= 1;
                            local_count += 1;
                            max_steal -= 1;
                            self.steals.fetch_add(1, Ordering::Relaxed);
                        }
                        Steal::Empty | Steal::Abort => {
                            self.failed_steals.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
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
