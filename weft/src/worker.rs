//! The per-thread fiber manager.
//!
//! Each OS worker thread hosts exactly one [`Worker`]: the current fiber,
//! the thread-bootstrap fiber, a lazily created maintenance fiber, the
//! scheduler handle and the *deferred-action slot*.
//!
//! ## Post-swap maintenance
//!
//! A suspending fiber must not touch shared state that could let another
//! worker wake it *before* its context switch completes — two workers
//! would then run the same stack. So every suspension writes at most one
//! [`Deferred`] action into its worker's slot and the action runs as the
//! first thing the *incoming* fiber does ([`Worker::do_maintenance`]),
//! once the suspending fiber is safely off its stack.

use crate::fiber::{Builder, Fiber, FiberRef, FiberState};
use crate::runtime::RuntimeInner;
use crate::scheduler::Scheduler;
use crate::stats::WorkerStats;
use crate::sync::mutex::RawMutex;
use crate::sync::spinlock::RawSpinLock;
use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};
use weft_context::Context;
use weft_lockfree::hazard::{HazardNode, HazardRecord};
use weft_lockfree::mpmc::MPMC_HAZARD_COUNT;
use weft_lockfree::{MpmcFifo, MpmcNode, MpscFifo};

/// Stack size of the per-worker maintenance fiber.
pub(crate) const MAINTENANCE_STACK_SIZE: usize = 102_400;

/// One thing to do after the next context switch, applied by
/// [`Worker::do_maintenance`] on the resumed fiber's stack. The suspension
/// paths each set at most one of these before yielding.
pub(crate) enum Deferred {
    /// Re-queue a fiber that yielded while still runnable.
    Schedule(FiberRef),
    /// Reclaim a fiber that exited.
    Destroy(FiberRef),
    /// Publish the suspending fiber into an MPMC wait queue (semaphore
    /// waits; MPSC waits push eagerly under `SavingStateToWait` instead).
    PushWaiter {
        fifo: NonNull<MpmcFifo<FiberRef>>,
        node: NonNull<MpmcNode<FiberRef>>,
    },
    /// Release a fiber mutex (condvar / multi-channel waits).
    UnlockMutex(NonNull<RawMutex>),
    /// Release a ticket spinlock (event-bridge waits).
    UnlockSpin(NonNull<RawSpinLock>),
    /// Store a value into a cell another party is polling (signal
    /// ready-to-wake handshake, join rendezvous).
    Store {
        location: NonNull<AtomicPtr<()>>,
        value: *mut (),
    },
}

pub(crate) struct Worker {
    id: usize,
    rt: Arc<RuntimeInner>,
    current: Cell<FiberRef>,
    /// The fiber we most recently switched away from; read by maintenance
    /// to commit its `SavingStateToWait`.
    old: Cell<Option<FiberRef>>,
    thread_fiber: FiberRef,
    maintenance: Cell<Option<FiberRef>>,
    deferred: Cell<Option<Deferred>>,
    hazard: Cell<Option<NonNull<HazardRecord>>>,
}

thread_local! {
    static CURRENT_WORKER: Cell<*const Worker> = const { Cell::new(ptr::null()) };
}

// === impl Worker ===

impl Worker {
    pub(crate) fn new(rt: Arc<RuntimeInner>, id: usize) -> Box<Worker> {
        let thread_fiber = Fiber::create_from_thread(id);
        Box::new(Worker {
            id,
            rt,
            current: Cell::new(thread_fiber),
            old: Cell::new(None),
            thread_fiber,
            maintenance: Cell::new(None),
            deferred: Cell::new(None),
            hazard: Cell::new(None),
        })
    }

    /// The worker driving the calling thread.
    ///
    /// The returned reference is *not* actually `'static`: it is valid
    /// until the worker shuts down, and — more importantly — the calling
    /// fiber may resume on a *different* worker after any suspension
    /// point. Always re-fetch after a yield.
    pub(crate) fn current() -> &'static Worker {
        Self::try_current().expect("not a weft runtime worker thread")
    }

    pub(crate) fn try_current() -> Option<&'static Worker> {
        let worker = CURRENT_WORKER.with(Cell::get);
        // Safety: the pointer is installed by `install` and cleared
        // before the worker box is dropped.
        NonNull::new(worker.cast_mut()).map(|p| unsafe { &*p.as_ptr() })
    }

    /// Publishes `worker` as the calling thread's manager (null clears).
    ///
    /// # Safety
    ///
    /// `worker` must outlive every fiber operation on this thread.
    pub(crate) unsafe fn install(worker: *const Worker) {
        CURRENT_WORKER.with(|c| c.set(worker));
    }

    #[inline]
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub(crate) fn rt(&self) -> &Arc<RuntimeInner> {
        &self.rt
    }

    #[inline]
    pub(crate) fn current_fiber(&self) -> FiberRef {
        self.current.get()
    }

    #[inline]
    pub(crate) fn thread_fiber(&self) -> FiberRef {
        self.thread_fiber
    }

    #[inline]
    pub(crate) fn maintenance_fiber(&self) -> Option<FiberRef> {
        self.maintenance.get()
    }

    pub(crate) fn adopt_as_maintenance(&self, fiber: FiberRef) {
        self.maintenance.set(Some(fiber));
    }

    #[inline]
    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.rt.schedulers[self.id]
    }

    #[inline]
    pub(crate) fn stats(&self) -> &WorkerStats {
        &self.rt.worker_stats[self.id]
    }

    pub(crate) fn set_deferred(&self, deferred: Deferred) {
        debug_assert!(
            self.deferred.replace(None).is_none(),
            "deferred-action slot already occupied"
        );
        self.deferred.set(Some(deferred));
    }

    /// Inserts a Ready fiber into this worker's run queue — except for
    /// pinned (thread-bootstrap) fibers, which are routed to their home
    /// worker's inbox so they never migrate and never become stealable.
    pub(crate) fn schedule(&self, fiber: FiberRef) {
        // Safety: queued fibers stay allocated.
        let f = unsafe { fiber.as_ref() };
        if f.is_thread() {
            let node = f.take_wait_node();
            // Safety: the node was just detached, exclusively ours.
            unsafe { node.put(fiber) };
            self.rt.inboxes[f.home()].push(node);
            return;
        }
        // Safety: each worker is the sole producer of its own scheduler.
        unsafe { self.scheduler().schedule(fiber) };
    }

    /// Pops the next fiber to run: the pinned inbox first (its fibers are
    /// invisible to thieves), then the scheduler.
    pub(crate) fn next_fiber(&self) -> Option<FiberRef> {
        // Safety: each worker is the sole consumer of its own inbox.
        if let Some(node) = unsafe { self.rt.inboxes[self.id].try_pop() } {
            // Safety: the popped node is exclusively ours.
            let fiber = unsafe { node.take() }.expect("inbox node without fiber");
            // Safety: queued fibers stay allocated.
            let f = unsafe { fiber.as_ref() };
            f.restore_wait_node(node);
            if f.state() == FiberState::SavingStateToWait {
                // woken before it finished suspending; cycle it back
                let node = f.take_wait_node();
                // Safety: just re-detached, exclusively ours.
                unsafe { node.put(fiber) };
                self.rt.inboxes[self.id].push(node);
            } else {
                return Some(fiber);
            }
        }
        // Safety: owner-side scheduler access.
        unsafe { self.scheduler().next() }
    }

    /// This worker's lazily created hazard-pointer record.
    pub(crate) fn hazard_record(&self) -> &HazardRecord {
        let record = self.hazard.get().unwrap_or_else(|| {
            let record = self.rt.hazards.acquire_record(MPMC_HAZARD_COUNT);
            self.hazard.set(Some(record));
            record
        });
        // Safety: records live until the runtime tears the domain down.
        unsafe { &*record.as_ptr() }
    }

    /// Grabs an MPMC wait-queue node from the runtime cache, or allocates
    /// one whose gc hook returns it there.
    pub(crate) fn get_mpmc_node(&self) -> Box<MpmcNode<FiberRef>> {
        match self.rt.free_nodes.try_pop() {
            // Safety: cached nodes are exclusively owned after the pop.
            Some(node) => unsafe { Box::from_raw(node.as_ptr()) },
            None => Box::new(MpmcNode::new(
                return_mpmc_node,
                Arc::as_ptr(&self.rt) as *mut (),
            )),
        }
    }

    /// Switches execution to `new`. A still-runnable `old` is marked Ready
    /// and re-queued via the deferred slot. Returns when `old` is next
    /// resumed — possibly on a different worker.
    pub(crate) fn switch_to(&self, old: FiberRef, new: FiberRef) {
        // Safety: `old` is the running fiber on this worker; `new` is
        // suspended and exclusively ours to resume (scheduler pop or
        // direct maintenance handoff).
        unsafe {
            let old_f = old.as_ref();
            if old_f.state() == FiberState::Running {
                old_f.set_state(FiberState::Ready);
                self.set_deferred(Deferred::Schedule(old));
            }
            self.current.set(new);
            self.old.set(Some(old));
            new.as_ref().set_state(FiberState::Running);
            Context::swap(old_f.context_ptr(), new.as_ref().context_ptr());
        }
        // `old` lives again - on whichever worker resumed it.
        Worker::current().do_maintenance();
    }

    /// Applies the suspending fiber's deferred state: first the
    /// `SavingStateToWait → Waiting` commit, then the action slot.
    pub(crate) fn do_maintenance(&self) {
        if let Some(old) = self.old.get() {
            // Safety: fibers are not freed while reachable from `old`
            // (destruction itself goes through the deferred slot).
            let old_f = unsafe { old.as_ref() };
            if old_f.state() == FiberState::SavingStateToWait {
                old_f.set_state(FiberState::Waiting);
            }
        }

        let Some(deferred) = self.deferred.take() else {
            return;
        };
        match deferred {
            Deferred::Schedule(fiber) => {
                debug_assert_eq!(unsafe { fiber.as_ref() }.state(), FiberState::Ready);
                self.schedule(fiber);
            }
            // Safety: the fiber finished and left its stack; nothing else
            // references it.
            Deferred::Destroy(fiber) => unsafe { Fiber::retire(&self.rt, fiber) },
            Deferred::PushWaiter { fifo, node } => {
                // Safety: queue and node were pinned by the suspending
                // fiber, which is parked until the push wakes it.
                unsafe {
                    fifo.as_ref()
                        .push(self.hazard_record(), Box::from_raw(node.as_ptr()));
                }
            }
            // Safety: the lock outlives its waiters by contract.
            Deferred::UnlockMutex(mutex) => {
                unsafe { mutex.as_ref() }.unlock_internal();
            }
            Deferred::UnlockSpin(lock) => unsafe { lock.as_ref() }.unlock(),
            Deferred::Store { location, value } => {
                // Safety: the cell belongs to the suspended fiber, which
                // stays parked until this store is observed.
                unsafe { location.as_ref().store(value, Ordering::Release) };
            }
        }
    }

    /// Gives up the processor: runs the next runnable fiber, or enters the
    /// maintenance fiber when the caller is suspending and nothing is
    /// runnable.
    pub(crate) fn yield_now(&self) {
        let mut worker = self;
        let current = worker.current.get();
        loop {
            WorkerStats::bump(&worker.stats().yields);
            // Safety: fibers stay allocated while running.
            let state = unsafe { current.as_ref() }.state();

            if let Some(new) = worker.next_fiber() {
                worker.switch_to(current, new);
                break;
            } else if matches!(
                state,
                FiberState::Waiting | FiberState::Done | FiberState::SavingStateToWait
            ) {
                let maintenance = worker.maintenance.get().unwrap_or_else(|| {
                    let fiber = Builder::new()
                        .stack_size(MAINTENANCE_STACK_SIZE)
                        .spawn_unscheduled_on(&worker.rt, maintenance_loop)
                        .expect("failed to create maintenance fiber");
                    worker.maintenance.set(Some(fiber));
                    fiber
                });
                worker.switch_to(current, maintenance);
                // re-grab the worker, we could be on a different thread now
                worker = Worker::current();
            } else {
                // occasionally steal some work from threads with more load
                if (worker.stats().yields.load(Ordering::Relaxed) & 1023) == 0 {
                    // Safety: owner-side scheduler access.
                    unsafe { worker.scheduler().load_balance(&worker.rt.schedulers) };
                }
                break;
            }
        }
    }
}

/// Gc hook for MPMC wait-queue nodes: back into the runtime's cache, or
/// freed when the cache is full.
unsafe fn return_mpmc_node(data: *mut (), hazard: NonNull<HazardNode>) {
    // Safety: `data` is the RuntimeInner this node was allocated under,
    // kept alive by the runtime handle and every JoinHandle.
    let rt = unsafe { &*(data as *const RuntimeInner) };
    // Safety: the hazard node is embedded in an MpmcNode.
    let node = unsafe { MpmcNode::<FiberRef>::from_hazard(hazard) };
    if rt.free_nodes.try_push(node).is_err() {
        // Safety: cache full; we own the node outright.
        drop(unsafe { Box::from_raw(node.as_ptr()) });
    }
}

/// The maintenance driver: runs runnable fibers, steals when idle, polls
/// the event bridge when there is nothing to run. Executes on the OS
/// thread itself for spawned workers, and as a lazily created fiber for
/// workers whose bootstrap fiber belongs to the application.
pub(crate) fn maintenance_loop() {
    let _span = tracing::debug_span!("maintenance", worker = Worker::current().id()).entered();

    while !Worker::current().rt.shutdown.load(Ordering::Acquire) {
        let worker = Worker::current();
        // Safety: owner-side scheduler access.
        unsafe { worker.scheduler().load_balance(&worker.rt.schedulers) };

        if let Some(new) = worker.next_fiber() {
            // wait until all work is done before being resumed again
            let me = worker.current_fiber();
            // Safety: `me` is the running fiber.
            unsafe { me.as_ref() }.set_state(FiberState::SavingStateToWait);
            worker.switch_to(me, new);
        } else {
            let serviced = worker.rt.event.poll(worker);
            if serviced == 0 {
                worker.rt.event.poll_blocking(worker, worker.rt.config.tick);
            }
        }
    }

    tracing::debug!("maintenance loop exiting");
}

// === suspension / wake helpers (the manager half of every primitive) ===

/// Parks the current fiber in an MPSC wait queue.
///
/// The push happens *eagerly*, before the context switch: the
/// `SavingStateToWait` state plus the scheduler's re-queue guard make that
/// safe (a waker that pops the node early schedules a fiber the scheduler
/// refuses to run until maintenance commits it to Waiting).
pub(crate) fn wait_in_mpsc_queue(fifo: &MpscFifo<FiberRef>) {
    let worker = Worker::current();
    let fiber = worker.current_fiber();
    // Safety: `fiber` is the running fiber.
    let f = unsafe { fiber.as_ref() };
    debug_assert_eq!(f.state(), FiberState::Running);

    f.set_state(FiberState::SavingStateToWait);
    let node = f.take_wait_node();
    // Safety: the node was just detached, we own it exclusively.
    unsafe { node.put(fiber) };
    fifo.push(node);
    worker.yield_now();
}

/// As [`wait_in_mpsc_queue`], additionally releasing `mutex` once the
/// fiber is off its stack (condition variables, multi-channels).
pub(crate) fn wait_in_mpsc_queue_and_unlock(fifo: &MpscFifo<FiberRef>, mutex: &RawMutex) {
    Worker::current().set_deferred(Deferred::UnlockMutex(NonNull::from(mutex)));
    wait_in_mpsc_queue(fifo);
}

/// Wakes at least `count` fibers parked in an MPSC wait queue; `count == 0`
/// makes a single non-blocking attempt. Returns the number woken.
pub(crate) fn wake_from_mpsc_queue(fifo: &MpscFifo<FiberRef>, count: usize) -> usize {
    let mut worker = Worker::current();
    let mut woken = 0;
    loop {
        // Safety: single-consumer access is serialised by the owning
        // primitive (only one unlocker/signaller pops at a time).
        if let Some(node) = unsafe { fifo.try_pop() } {
            // Safety: the popped node is exclusively ours.
            let fiber = unsafe { node.take() }.expect("wait node without fiber");
            // Safety: parked fibers stay allocated until woken and run.
            let f = unsafe { fiber.as_ref() };
            f.restore_wait_node(node);
            if f.state() == FiberState::Waiting {
                f.set_state(FiberState::Ready);
            }
            worker.schedule(fiber);
            woken += 1;
        } else if count > 0 {
            // a pusher is mid-flight; let other fibers run while the list
            // stitches
            WorkerStats::bump(&worker.stats().wake_mpsc_spins);
            worker.yield_now();
            worker = Worker::current();
        }
        if woken >= count {
            return woken;
        }
    }
}

/// Parks the current fiber in an MPMC wait queue. The push is deferred to
/// post-swap maintenance — MPMC queues have no saving-state guard, so the
/// fiber must be fully off its stack before it becomes poppable.
pub(crate) fn wait_in_mpmc_queue(fifo: &MpmcFifo<FiberRef>) {
    let worker = Worker::current();
    let fiber = worker.current_fiber();
    // Safety: `fiber` is the running fiber.
    let f = unsafe { fiber.as_ref() };
    debug_assert_eq!(f.state(), FiberState::Running);

    f.set_state(FiberState::Waiting);
    let mut node = worker.get_mpmc_node();
    node.set_value(fiber);
    worker.set_deferred(Deferred::PushWaiter {
        fifo: NonNull::from(fifo),
        // Safety: Box::into_raw never returns null.
        node: unsafe { NonNull::new_unchecked(Box::into_raw(node)) },
    });
    worker.yield_now();
}

/// Wakes at least `count` fibers from an MPMC wait queue; `count == 0`
/// makes a single attempt.
pub(crate) fn wake_from_mpmc_queue(fifo: &MpmcFifo<FiberRef>, count: usize) -> usize {
    let worker = Worker::current();
    let record = worker.hazard_record();
    let mut woken = 0;
    loop {
        if let Some(fiber) = fifo.try_pop(record) {
            // Safety: parked fibers stay allocated until woken and run.
            let f = unsafe { fiber.as_ref() };
            debug_assert_eq!(f.state(), FiberState::Waiting);
            f.set_state(FiberState::Ready);
            worker.schedule(fiber);
            woken += 1;
        } else if count > 0 {
            // back off if we failed to pop something
            core::hint::spin_loop();
            WorkerStats::bump(&worker.stats().wake_mpmc_spins);
        }
        if woken >= count {
            return woken;
        }
    }
}

/// Parks the current fiber, publishing `value` into `location` once the
/// fiber is off its stack. The other side of the rendezvous spins in
/// [`clear_or_wait`] (or on the signal scratch slot), so the publish
/// doubles as the "safe to wake" edge.
pub(crate) fn set_and_wait(location: &AtomicPtr<()>, value: *mut ()) {
    let worker = Worker::current();
    let fiber = worker.current_fiber();
    // Safety: `fiber` is the running fiber.
    let f = unsafe { fiber.as_ref() };
    debug_assert_eq!(f.state(), FiberState::Running);

    f.set_state(FiberState::Waiting);
    worker.set_deferred(Deferred::Store {
        location: NonNull::from(location),
        value,
    });
    worker.yield_now();
}

/// Takes the value out of a rendezvous cell, yielding until one appears.
pub(crate) fn clear_or_wait(location: &AtomicPtr<()>) -> *mut () {
    loop {
        let value = location.swap(ptr::null_mut(), Ordering::AcqRel);
        if !value.is_null() {
            return value;
        }
        Worker::current().yield_now();
    }
}
