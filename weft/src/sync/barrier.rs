//! A cyclic barrier.
//!
//! The N-th fiber to arrive in each cycle wakes the other N−1 and is the
//! cycle's *serial* fiber ([`BarrierWaitResult::is_leader`]); everyone
//! else parks in a strict-FIFO queue. The monotonically increasing
//! arrival counter makes the barrier reusable without a reset step.

use crate::error::Error;
use crate::fiber::FiberRef;
use crate::worker;
use std::sync::atomic::{AtomicU64, Ordering};
use weft_lockfree::MpscFifo;

pub struct Barrier {
    count: u64,
    counter: AtomicU64,
    waiters: MpscFifo<FiberRef>,
}

/// Returned by [`Barrier::wait`]; exactly one fiber per cycle observes
/// [`BarrierWaitResult::is_leader`] `== true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierWaitResult(bool);

impl BarrierWaitResult {
    pub fn is_leader(self) -> bool {
        self.0
    }
}

// === impl Barrier ===

impl Barrier {
    /// A barrier releasing its waiters in cycles of `count` fibers.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a zero count.
    pub fn new(count: u32) -> Result<Self, Error> {
        if count == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            count: u64::from(count),
            counter: AtomicU64::new(0),
            waiters: MpscFifo::new(),
        })
    }

    /// Parks until `count` fibers (this one included) have arrived.
    ///
    /// Writes performed by any participant before its `wait` are visible
    /// to every participant after the barrier releases.
    pub fn wait(&self) -> BarrierWaitResult {
        let new_value = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        if new_value % self.count == 0 {
            worker::wake_from_mpsc_queue(
                &self.waiters,
                usize::try_from(self.count - 1).unwrap_or(usize::MAX),
            );
            BarrierWaitResult(true)
        } else {
            worker::wait_in_mpsc_queue(&self.waiters);
            BarrierWaitResult(false)
        }
    }
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier")
            .field("count", &self.count)
            .field("arrived", &self.counter.load(Ordering::Relaxed))
            .finish()
    }
}
