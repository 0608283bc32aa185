//! Single-slot wake rendezvous.
//!
//! [`Signal`] pairs exactly one waiter with any number of raisers;
//! [`MultiSignal`] allows any number of waiters. Both use the
//! *ready-to-wake handshake*: a raiser that finds a parked fiber spins
//! until the fiber's scratch slot carries the sentinel that post-swap
//! maintenance writes, proving the fiber has fully left its old stack and
//! may be rescheduled. Without the handshake a fast raiser could resume a
//! fiber whose registers are still being saved — one stack, two workers.
//!
//! The raiser's spin assumes the waiter always completes its transition;
//! that holds because waits cannot be cancelled.

use crate::fiber::{Fiber, FiberRef, FiberState, WaitNode};
use crate::stats::WorkerStats;
use crate::worker::{Deferred, Worker};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use weft_lockfree::{AbaCell, Relax};

/// Sentinel written into a waiter's scratch slot once its suspension has
/// committed.
pub(crate) const READY_TO_WAKE: *mut () = usize::MAX as *mut ();

/// `Signal.waiter` value while raised with no waiter present.
const SIGNAL_RAISED: *mut Fiber = usize::MAX as *mut Fiber;

/// `MultiSignal` head value while raised with no waiters present.
const MULTI_RAISED: *mut WaitNode = usize::MAX as *mut WaitNode;

/// A single-waiter signal: `wait` parks the calling fiber unless a raise
/// is already pending; `raise` wakes the waiter or leaves the signal in
/// the raised state. Channels use it as their "data ready" doorbell.
pub struct Signal {
    waiter: AtomicPtr<Fiber>,
}

// === impl Signal ===

impl Signal {
    pub const fn new() -> Self {
        Self {
            waiter: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Parks the calling fiber until the signal is raised; consumes a
    /// pending raise immediately. At most one fiber may wait at a time.
    pub fn wait(&self) {
        let worker = Worker::current();
        let fiber = worker.current_fiber();
        // Safety: `fiber` is the running fiber.
        let f = unsafe { fiber.as_ref() };

        // clear scratch before publishing ourselves as the waiter
        f.scratch.store(ptr::null_mut(), Ordering::Relaxed);
        if self
            .waiter
            .compare_exchange(
                ptr::null_mut(),
                fiber.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            // not raised; we are now the waiter
            debug_assert_eq!(f.state(), FiberState::Running);
            f.set_state(FiberState::Waiting);
            // the raiser will not wake us until maintenance publishes the
            // ready-to-wake sentinel into scratch, i.e. after the swap
            worker.set_deferred(Deferred::Store {
                location: NonNull::from(&f.scratch),
                value: READY_TO_WAKE,
            });
            worker.yield_now();
            f.scratch.store(ptr::null_mut(), Ordering::Relaxed);
        }
        // the signal has been raised
        self.waiter.store(ptr::null_mut(), Ordering::Release);
    }

    /// Raises the signal. Returns whether a parked fiber was woken.
    pub fn raise(&self) -> bool {
        let old = self.waiter.swap(SIGNAL_RAISED, Ordering::AcqRel);
        if !old.is_null() && old != SIGNAL_RAISED {
            // we signalled while a fiber was waiting
            self.waiter.store(ptr::null_mut(), Ordering::Release);
            let worker = Worker::current();
            // Safety: the waiter published itself and stays allocated
            // until woken.
            let fiber = unsafe { FiberRef::new_unchecked(old) };
            let f = unsafe { fiber.as_ref() };
            while f.scratch.load(Ordering::Acquire) != READY_TO_WAKE {
                // the waiter is still in the process of going to sleep
                core::hint::spin_loop();
                WorkerStats::bump(&worker.stats().signal_spins);
            }
            f.set_state(FiberState::Ready);
            worker.schedule(fiber);
            return true;
        }
        false
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.waiter.load(Ordering::Relaxed) {
            p if p.is_null() => "idle",
            p if p == SIGNAL_RAISED => "raised",
            _ => "waited-on",
        };
        f.debug_struct("Signal").field("state", &state).finish()
    }
}

/// A many-waiter signal: waiters push their pre-allocated wait nodes onto
/// an ABA-counted stack; each raise pops and wakes one. A raise with no
/// waiters parks as "raised" and the next wait consumes it without
/// sleeping.
pub struct MultiSignal {
    head: AbaCell<WaitNode>,
}

// === impl MultiSignal ===

impl MultiSignal {
    pub const fn new() -> Self {
        Self {
            head: AbaCell::empty(),
        }
    }

    /// Parks the calling fiber until a raise is delivered to it (or
    /// consumes a pending raise immediately).
    pub fn wait(&self) {
        let worker = Worker::current();
        let fiber = worker.current_fiber();
        // Safety: `fiber` is the running fiber.
        let f = unsafe { fiber.as_ref() };

        // clear scratch before becoming wakeable
        f.scratch.store(ptr::null_mut(), Ordering::Relaxed);
        let node = f.take_wait_node();
        // Safety: the node was just detached, exclusively ours.
        unsafe { node.put(fiber) };
        let node = Box::into_raw(node);

        let mut relax = Relax::new();
        loop {
            // the counter is read together with the head, so nothing can
            // change under us unnoticed
            let snapshot = self.head.load(Ordering::Acquire);

            if snapshot.ptr == MULTI_RAISED {
                // try to consume the raise instead of sleeping
                if self
                    .head
                    .compare_exchange_weak(snapshot, snapshot.with_ptr(ptr::null_mut()))
                {
                    // Safety: the node never left our ownership.
                    let node = unsafe { Box::from_raw(node) };
                    // Safety: still exclusively ours.
                    unsafe { node.take() };
                    f.restore_wait_node(node);
                    return;
                }
            } else {
                // 0 or more waiters: push ourselves and sleep
                // Safety: we own the node until the CAS publishes it.
                unsafe { (*node).set_next(snapshot.ptr) };
                if self.head.compare_exchange_weak(snapshot, snapshot.with_ptr(node)) {
                    debug_assert_eq!(f.state(), FiberState::Running);
                    f.set_state(FiberState::Waiting);
                    // ready-to-wake handshake, as in Signal::wait
                    worker.set_deferred(Deferred::Store {
                        location: NonNull::from(&f.scratch),
                        value: READY_TO_WAKE,
                    });
                    worker.yield_now();
                    f.scratch.store(ptr::null_mut(), Ordering::Relaxed);
                    return;
                }
            }
            relax.pause();
        }
    }

    /// Wakes one waiter, or parks the signal in the raised state when no
    /// waiter is present (re-raising an already-raised signal is a no-op
    /// but must still CAS, so no wake is ever missed). Returns whether a
    /// fiber was woken.
    pub fn raise(&self) -> bool {
        let mut relax = Relax::new();
        loop {
            let snapshot = self.head.load(Ordering::Acquire);

            if snapshot.ptr.is_null() || snapshot.ptr == MULTI_RAISED {
                if self
                    .head
                    .compare_exchange_weak(snapshot, snapshot.with_ptr(MULTI_RAISED))
                {
                    return false;
                }
            } else if self.try_wake_top(snapshot).is_some() {
                return true;
            }
            relax.pause();
        }
    }

    /// Wakes exactly one waiter, waiting for one to arrive. For uses
    /// where a raise must be delivered to a fiber, never parked.
    ///
    /// An empty stack here is not CAS contention — a waiter may be
    /// arbitrarily far away — so once the relax budget is spent the
    /// raiser yields its worker instead of monopolising it.
    pub fn raise_strict(&self) {
        let mut relax = Relax::new();
        loop {
            let snapshot = self.head.load(Ordering::Acquire);
            if snapshot.ptr != MULTI_RAISED
                && !snapshot.ptr.is_null()
                && self.try_wake_top(snapshot).is_some()
            {
                return;
            }
            if relax.is_spent() {
                Worker::current().yield_now();
                relax.reset();
            } else {
                relax.pause();
            }
        }
    }

    /// Attempts to pop and wake the fiber at `snapshot.ptr` (non-null,
    /// not the raised sentinel).
    fn try_wake_top(&self, snapshot: weft_lockfree::Tagged<WaitNode>) -> Option<FiberRef> {
        // Reading head->next before winning the CAS is only safe because
        // wait nodes are recycled through fibers, never freed while a
        // raise may be in flight (inherited, known weakness of the
        // original design).
        // Safety: see above.
        let next = unsafe { (*snapshot.ptr).next() };
        if !self.head.compare_exchange_weak(snapshot, snapshot.with_ptr(next)) {
            return None;
        }

        // Safety: the CAS handed us the node.
        let node = unsafe { Box::from_raw(snapshot.ptr) };
        // Safety: exclusively ours now.
        let fiber = unsafe { node.take() }.expect("multi-signal node without fiber");
        // Safety: parked fibers stay allocated until woken.
        let f = unsafe { fiber.as_ref() };
        f.restore_wait_node(node);

        let worker = Worker::current();
        while f.scratch.load(Ordering::Acquire) != READY_TO_WAKE {
            // the waiter is still in the process of going to sleep
            core::hint::spin_loop();
            WorkerStats::bump(&worker.stats().multi_signal_spins);
        }
        f.set_state(FiberState::Ready);
        worker.schedule(fiber);
        Some(fiber)
    }
}

impl Default for MultiSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MultiSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let head = self.head.load(Ordering::Relaxed);
        let state = if head.ptr == MULTI_RAISED {
            "raised"
        } else if head.ptr.is_null() {
            "idle"
        } else {
            "waited-on"
        };
        f.debug_struct("MultiSignal").field("state", &state).finish()
    }
}
