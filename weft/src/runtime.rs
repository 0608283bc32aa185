//! The runtime handle: worker threads, schedulers, pools and teardown.
//!
//! All of the C-era process-wide state — free-fiber LIFO, MPMC node
//! cache, hazard-pointer head, event bridge, fd table — is bundled into
//! one [`RuntimeInner`] that workers, schedulers and primitives reach
//! through the current worker, so several independent runtimes can
//! coexist in one process (on disjoint thread sets).

use crate::config::Config;
use crate::error::Error;
use crate::event::EventLoop;
use crate::fiber::{self, Fiber, FiberRef};
use crate::io::FdTable;
use crate::scheduler::Scheduler;
use crate::stats::{Stats, WorkerStats};
use crate::worker::{self, Worker};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use weft_lockfree::{MpmcLifo, MpmcNode, MpscFifo, RingBuffer};

/// Stack size for the spawned OS worker threads.
const WORKER_THREAD_STACK_SIZE: usize = 1_024_000;

/// log2 of the MPMC node cache capacity.
const FREE_NODE_CACHE_BITS: u32 = 10;

pub(crate) struct RuntimeInner {
    pub(crate) config: Config,
    pub(crate) shutdown: AtomicBool,
    pub(crate) schedulers: Box<[Scheduler]>,
    /// Per-worker inboxes for fibers pinned to a worker (the
    /// thread-bootstrap fibers): multi-producer, drained only by the
    /// owning worker, and never visible to thieves.
    pub(crate) inboxes: Box<[MpscFifo<FiberRef>]>,
    pub(crate) worker_stats: Box<[WorkerStats]>,
    /// Done fibers parked for reuse, each on its own wait node.
    pub(crate) free_fibers: MpmcLifo<FiberRef>,
    /// Reclaimed MPMC wait-queue nodes.
    pub(crate) free_nodes: RingBuffer<MpmcNode<FiberRef>>,
    pub(crate) hazards: weft_lockfree::hazard::HazardDomain,
    pub(crate) event: EventLoop,
    pub(crate) io: FdTable,
}

/// A running fiber runtime.
///
/// [`Runtime::start`] converts the calling thread into worker 0 and spawns
/// `workers - 1` further OS threads; from that point the calling thread
/// *is* a fiber (the bootstrap fiber) and may use every fiber operation
/// directly. The handle is deliberately `!Send`: teardown must happen on
/// the thread that started the runtime.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
    worker0: *mut Worker,
    threads: Vec<thread::JoinHandle<()>>,
    shut_down: bool,
}

// === impl Runtime ===

impl Runtime {
    /// Starts a runtime and adopts the calling thread as worker 0.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if this thread already belongs to a
    /// runtime, [`Error::InvalidArgument`] for a zero worker count, and
    /// allocation/OS failures as [`Error::OutOfMemory`].
    pub fn start(config: Config) -> Result<Runtime, Error> {
        if Worker::try_current().is_some() {
            return Err(Error::InvalidState);
        }
        if config.workers == 0 {
            return Err(Error::InvalidArgument);
        }

        let workers = config.workers;
        let inner = Arc::new(RuntimeInner {
            shutdown: AtomicBool::new(false),
            schedulers: (0..workers).map(Scheduler::new).collect(),
            inboxes: (0..workers).map(|_| MpscFifo::new()).collect(),
            worker_stats: (0..workers).map(|_| WorkerStats::default()).collect(),
            free_fibers: MpmcLifo::new(),
            free_nodes: RingBuffer::new(FREE_NODE_CACHE_BITS),
            hazards: weft_lockfree::hazard::HazardDomain::new(),
            event: EventLoop::new(&config)?,
            io: FdTable::new()?,
            config,
        });

        let worker0 = Box::into_raw(Worker::new(inner.clone(), 0));
        // Safety: the pointer is cleared again (and the box reclaimed) in
        // `shutdown_inner` before anything is freed.
        unsafe { Worker::install(worker0) };

        let mut threads = Vec::with_capacity(workers - 1);
        for id in 1..workers {
            let rt = inner.clone();
            let thread = thread::Builder::new()
                .name(format!("weft-worker-{id}"))
                .stack_size(WORKER_THREAD_STACK_SIZE)
                .spawn(move || worker_thread(rt, id))
                .map_err(|_| Error::OutOfMemory);
            match thread {
                Ok(thread) => threads.push(thread),
                Err(err) => {
                    // roll back: let the already-spawned workers exit
                    inner.shutdown.store(true, Ordering::Release);
                    for thread in threads {
                        let _ = thread.join();
                    }
                    // Safety: reverses the install/new above.
                    unsafe {
                        Worker::install(ptr::null());
                        let worker0 = Box::from_raw(worker0);
                        Fiber::destroy(worker0.thread_fiber());
                    }
                    return Err(err);
                }
            }
        }

        tracing::debug!(workers, "runtime started");
        Ok(Runtime {
            inner,
            worker0,
            threads,
            shut_down: false,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.inner.config.workers
    }

    /// Sums every worker's counters.
    pub fn stats(&self) -> Stats {
        let mut out = Stats::default();
        for stats in &self.inner.worker_stats {
            stats.add_to(&mut out);
        }
        for scheduler in &self.inner.schedulers {
            let (steals, failed) = scheduler.steal_counts();
            out.steals += steals;
            out.failed_steals += failed;
        }
        out
    }

    /// Cooperative teardown: signals every maintenance loop to finish,
    /// joins this worker's maintenance fiber and all worker threads, then
    /// reclaims pools and hazard records.
    ///
    /// Fibers still parked or runnable on other workers are abandoned, so
    /// join everything that matters first.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        let worker = Worker::current();
        self.inner.shutdown.store(true, Ordering::Release);
        tracing::debug!("runtime shutting down");

        // Join our own maintenance fiber (it exits its loop and takes the
        // regular fiber exit path). Blocked pollers notice the flag within
        // one tick.
        if let Some(maintenance) = worker.maintenance_fiber()
            && let Ok(result) = fiber::join_raw(maintenance)
        {
            // Safety: unclaimed exit result of the maintenance fiber.
            unsafe { fiber::discard_result(result) };
        }

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }

        // Drain the fiber pool.
        while let Some(node) = self.inner.free_fibers.try_pop() {
            // Safety: the pool owns these fibers; restore the node so
            // destroy can free it with the fiber.
            unsafe {
                let fiber = node.take().expect("pooled node without fiber");
                fiber.as_ref().restore_wait_node(node);
                Fiber::destroy(fiber);
            }
        }

        // Safety: all workers have stopped; no hazard slots are live. This
        // may push reclaimed nodes into the cache, so drain it afterwards.
        unsafe { self.inner.hazards.destroy_all() };
        while let Some(node) = self.inner.free_nodes.try_pop() {
            // Safety: cached nodes are exclusively owned.
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }

        // Tear down worker 0 last: its thread fiber is the caller.
        // Safety: reverses `start`'s install; no fiber operation can run
        // on this thread afterwards.
        unsafe {
            Worker::install(ptr::null());
            let worker0 = Box::from_raw(self.worker0);
            Fiber::destroy(worker0.thread_fiber());
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.inner.config.workers)
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

/// Body of the spawned worker threads: the OS thread itself hosts the
/// maintenance loop (its bootstrap fiber *is* the maintenance fiber).
fn worker_thread(rt: Arc<RuntimeInner>, id: usize) {
    let worker = Worker::new(rt, id);
    worker.adopt_as_maintenance(worker.thread_fiber());
    // Safety: cleared below before the worker is dropped.
    unsafe { Worker::install(&raw const *worker) };

    worker::maintenance_loop();

    // Safety: the loop has exited; nothing on this thread touches fibers
    // any more.
    unsafe {
        Worker::install(ptr::null());
        Fiber::destroy(worker.thread_fiber());
    }
    drop(worker);
}
