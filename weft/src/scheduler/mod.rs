//! Per-worker run queues with work stealing.
//!
//! Two interchangeable variants fulfil the same contract —
//! `schedule`/`next`/`load_balance` plus steal counters:
//!
//! - [`wsd`]: a double-buffered pair of Chase–Lev deques per worker
//!   (default).
//! - [`dist`]: one distinguished FIFO per worker, selected by the
//!   `dist-scheduler` cargo feature.
//!
//! Both re-queue fibers observed in `SavingStateToWait` instead of
//! running them: a racing wake can insert a fiber that has not finished
//! leaving its old stack yet, and running it then would put one stack
//! under two workers.

cfg_if::cfg_if! {
    if #[cfg(feature = "dist-scheduler")] {
        mod dist;
        pub(crate) use dist::Scheduler;
    } else {
        mod wsd;
        pub(crate) use wsd::Scheduler;
    }
}
