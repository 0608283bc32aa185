use core::sync::atomic::{AtomicU64, Ordering};

/// Per-worker event counters. Incremented relaxed by the owning worker,
/// read by [`Runtime::stats`](crate::Runtime::stats) from anywhere.
#[derive(Debug, Default)]
pub(crate) struct WorkerStats {
    pub yields: AtomicU64,
    pub spins: AtomicU64,
    pub signal_spins: AtomicU64,
    pub multi_signal_spins: AtomicU64,
    pub wake_mpsc_spins: AtomicU64,
    pub wake_mpmc_spins: AtomicU64,
    pub polls: AtomicU64,
    pub event_waits: AtomicU64,
    pub lock_contention: AtomicU64,
}

impl WorkerStats {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_to(&self, out: &mut Stats) {
        out.yields += self.yields.load(Ordering::Relaxed);
        out.spins += self.spins.load(Ordering::Relaxed);
        out.signal_spins += self.signal_spins.load(Ordering::Relaxed);
        out.multi_signal_spins += self.multi_signal_spins.load(Ordering::Relaxed);
        out.wake_mpsc_spins += self.wake_mpsc_spins.load(Ordering::Relaxed);
        out.wake_mpmc_spins += self.wake_mpmc_spins.load(Ordering::Relaxed);
        out.polls += self.polls.load(Ordering::Relaxed);
        out.event_waits += self.event_waits.load(Ordering::Relaxed);
        out.lock_contention += self.lock_contention.load(Ordering::Relaxed);
    }
}

/// Aggregated runtime counters, summed over all workers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Stats {
    /// Scheduling decisions taken.
    pub yields: u64,
    /// Fibers stolen from other workers.
    pub steals: u64,
    /// Steal attempts that found nothing (or lost a race).
    pub failed_steals: u64,
    /// Ticket-spinlock spins.
    pub spins: u64,
    /// Raiser spins waiting for a signal waiter to finish saving state.
    pub signal_spins: u64,
    /// Same, for multi-signals.
    pub multi_signal_spins: u64,
    /// Spins waking from MPSC wait queues (unstitched pushes).
    pub wake_mpsc_spins: u64,
    /// Spins waking from MPMC wait queues.
    pub wake_mpmc_spins: u64,
    /// Event source polls.
    pub polls: u64,
    /// Fibers parked waiting for fd readiness.
    pub event_waits: u64,
    /// Contended mutex acquisitions.
    pub lock_contention: u64,
}
