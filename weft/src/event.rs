//! The event/poll bridge: fd readiness waits, timers and sleeps.
//!
//! An epoll instance plus a timerfd ticking at the configured resolution.
//! Fibers waiting on a descriptor register one-shot interest and park on
//! a per-fd waiter list (threaded through their scratch slots); sleepers
//! park on a wake-time-keyed tree with one list per due-tick. Suspension
//! uses the maintenance protocol: the fd (or sleep) spinlock is released
//! only after the fiber has left its stack, so the poll side can never
//! wake a half-suspended fiber.
//!
//! Linux only, like the original's native backend.

#![allow(clippy::cast_possible_truncation, reason = "libc interfaces")]

use crate::config::Config;
use crate::error::Error;
use crate::fiber::{Fiber, FiberRef, FiberState};
use crate::stats::WorkerStats;
use crate::sync::spinlock::RawSpinLock;
use crate::worker::{Deferred, Worker};
use bitflags::bitflags;
use std::cell::{Cell, UnsafeCell};
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[cfg(not(target_os = "linux"))]
compile_error!("the weft event bridge requires epoll and timerfd (Linux)");

bitflags! {
    /// Readiness interest for [`wait_for_event`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
    }
}

/// How many epoll events one poll drains at most.
const EVENT_BATCH: usize = 64;

/// Per-fd wait state. All fields are guarded by `lock`.
struct FdWait {
    lock: RawSpinLock,
    /// Armed epoll interest (EPOLLIN/EPOLLOUT).
    events: Cell<u32>,
    added: Cell<bool>,
    /// Waiting fibers, threaded through their scratch slots.
    waiters: Cell<*mut Fiber>,
}

// Safety: guarded by the per-entry spinlock.
unsafe impl Sync for FdWait {}
unsafe impl Send for FdWait {}

/// One parked sleeper. Lives on the sleeping fiber's stack; reachable
/// from the tree only while the fiber is parked, all under `sleep_lock`.
struct SleepNode {
    wake_tick: u64,
    fiber: Option<FiberRef>,
    /// Other sleepers due the same tick.
    next: *mut SleepNode,
    left: *mut SleepNode,
    right: *mut SleepNode,
}

pub(crate) struct EventLoop {
    epoll_fd: RawFd,
    timer_fd: RawFd,
    wait_info: Box<[FdWait]>,
    sleep_lock: RawSpinLock,
    /// Tree of sleepers keyed by wake tick. Guarded by `sleep_lock`.
    sleepers: UnsafeCell<*mut SleepNode>,
    /// Timer expirations observed so far. Guarded by `sleep_lock`.
    tick_count: UnsafeCell<u64>,
    tick: Duration,
    /// Only one worker blocks in epoll at a time; the rest nap for a tick.
    blocking_poller: AtomicBool,
}

// Safety: the UnsafeCells are guarded by `sleep_lock`; the rest is
// either immutable or internally synchronised.
unsafe impl Sync for EventLoop {}
unsafe impl Send for EventLoop {}

// === impl EventLoop ===

impl EventLoop {
    pub(crate) fn new(config: &Config) -> Result<Self, Error> {
        let max_fd = crate::io::max_open_files()?;

        // Safety: plain syscalls; fds are owned by the struct from here.
        unsafe {
            let timer_fd = libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK);
            if timer_fd < 0 {
                return Err(Error::OutOfMemory);
            }

            let tick = libc::timespec {
                tv_sec: config.tick.as_secs() as libc::time_t,
                tv_nsec: config.tick.subsec_nanos() as libc::c_long,
            };
            let spec = libc::itimerspec {
                it_interval: tick,
                it_value: tick,
            };
            if libc::timerfd_settime(timer_fd, 0, &spec, ptr::null_mut()) != 0 {
                libc::close(timer_fd);
                return Err(Error::InvalidArgument);
            }

            let epoll_fd = libc::epoll_create1(0);
            if epoll_fd < 0 {
                libc::close(timer_fd);
                return Err(Error::OutOfMemory);
            }

            let mut event = libc::epoll_event {
                events: libc::EPOLLIN as u32,
                u64: timer_fd as u64,
            };
            if libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, timer_fd, &mut event) != 0 {
                libc::close(epoll_fd);
                libc::close(timer_fd);
                return Err(Error::InvalidArgument);
            }

            Ok(Self {
                epoll_fd,
                timer_fd,
                wait_info: (0..max_fd)
                    .map(|_| FdWait {
                        lock: RawSpinLock::new(),
                        events: Cell::new(0),
                        added: Cell::new(false),
                        waiters: Cell::new(ptr::null_mut()),
                    })
                    .collect(),
                sleep_lock: RawSpinLock::new(),
                sleepers: UnsafeCell::new(ptr::null_mut()),
                tick_count: UnsafeCell::new(0),
                tick: config.tick,
                blocking_poller: AtomicBool::new(false),
            })
        }
    }

    /// Non-blocking drain of ready events. Returns the number serviced.
    pub(crate) fn poll(&self, worker: &Worker) -> usize {
        self.poll_internal(worker, 0)
    }

    /// Blocks in the event source for up to `timeout`. Only one worker at
    /// a time actually blocks; the others sleep the timeout in real time
    /// so every idle worker still re-checks for work once per tick.
    pub(crate) fn poll_blocking(&self, worker: &Worker, timeout: Duration) -> usize {
        if self
            .blocking_poller
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            std::thread::sleep(timeout);
            return 0;
        }
        let serviced = self.poll_internal(worker, timeout.as_millis() as i32);
        self.blocking_poller.store(false, Ordering::Release);
        serviced
    }

    fn poll_internal(&self, worker: &Worker, timeout_ms: i32) -> usize {
        let mut events: [libc::epoll_event; EVENT_BATCH] =
            // Safety: epoll_event is plain old data.
            unsafe { std::mem::zeroed() };

        // Safety: valid fd and buffer.
        let count = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                EVENT_BATCH as i32,
                timeout_ms,
            )
        };
        if count < 0 {
            let errno = std::io::Error::last_os_error();
            // interrupted, just try again later (could be a debugger)
            assert_eq!(
                errno.kind(),
                std::io::ErrorKind::Interrupted,
                "epoll_wait failed: {errno}"
            );
            return 0;
        }

        WorkerStats::bump(&worker.stats().polls);

        for event in &events[..count as usize] {
            let fd = event.u64 as RawFd;
            if fd == self.timer_fd {
                let mut expirations: u64 = 0;
                // Safety: reading 8 bytes from a timerfd.
                let ret = unsafe {
                    libc::read(
                        self.timer_fd,
                        (&raw mut expirations).cast(),
                        size_of::<u64>(),
                    )
                };
                if ret != size_of::<u64>() as isize {
                    // another worker drained the timer first
                    continue;
                }
                self.wake_sleepers(worker, expirations);
            } else {
                let info = &self.wait_info[fd as usize];
                info.lock.lock();
                let residual =
                    info.events.get() & !event.events & (libc::EPOLLIN | libc::EPOLLOUT) as u32;
                info.events.set(residual);
                if residual != 0 {
                    // someone still waits for the other direction
                    self.arm(fd, residual, true);
                }
                wake_fd_waiters(worker, info, 0);
                info.lock.unlock();
            }
        }
        count as usize
    }

    /// (Re-)arms one-shot epoll interest for `fd`. Caller holds the fd's
    /// spinlock.
    fn arm(&self, fd: RawFd, events: u32, added: bool) {
        let mut event = libc::epoll_event {
            events: libc::EPOLLONESHOT as u32 | events,
            u64: fd as u64,
        };
        let op = if added {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        // Safety: valid fds; failure here means the fd went away, which
        // the waiter discovers through fd_closed.
        unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
    }

    /// Wakes every sleeper whose tick has come. `expirations` timer ticks
    /// have elapsed since the last call.
    fn wake_sleepers(&self, worker: &Worker, expirations: u64) {
        self.sleep_lock.lock();

        // Safety: guarded by sleep_lock.
        unsafe {
            let now = {
                let tick_count = self.tick_count.get();
                *tick_count += expirations;
                *tick_count
            };

            loop {
                let due = remove_due(&mut *self.sleepers.get(), now);
                if due.is_null() {
                    break;
                }
                let mut node = due;
                while !node.is_null() {
                    // the node lives on the sleeper's stack: read the link
                    // before the wake, not after
                    let next = (*node).next;
                    let fiber = (*node).fiber.take().expect("sleeper without fiber");
                    let f = fiber.as_ref();
                    debug_assert_eq!(f.state(), FiberState::Waiting);
                    f.set_state(FiberState::Ready);
                    worker.schedule(fiber);
                    node = next;
                }
            }
        }

        self.sleep_lock.unlock();
    }

    /// Force-wakes all waiters on `fd` with the closed indication and
    /// drops its epoll registration.
    pub(crate) fn fd_closed(&self, fd: RawFd) {
        let Some(info) = self.wait_info.get(usize::try_from(fd).unwrap_or(usize::MAX)) else {
            return;
        };
        let worker = Worker::current();

        info.lock.lock();
        if info.events.get() != 0 || info.added.get() {
            // Safety: dropping a registration; the fd may already be gone.
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut());
            }
            info.events.set(0);
            info.added.set(false);
        }
        wake_fd_waiters(worker, info, -1);
        info.lock.unlock();
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Safety: owned fds.
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.timer_fd);
        }
    }
}

/// Wakes the fibers on an fd waiter list, writing `result` into each
/// fiber's scratch slot (0 = ready, -1 = descriptor closed). Caller holds
/// the entry's spinlock.
fn wake_fd_waiters(worker: &Worker, info: &FdWait, result: isize) {
    let mut waiter = info.waiters.get();
    while !waiter.is_null() {
        // Safety: parked fibers stay allocated; the spinlock orders us
        // after the waiter's deferred unlock, i.e. after its suspension
        // committed.
        let fiber = unsafe { FiberRef::new_unchecked(waiter) };
        let f = unsafe { fiber.as_ref() };
        waiter = f.scratch.load(Ordering::Relaxed).cast();
        f.scratch.store(result as *mut (), Ordering::Relaxed);
        f.set_state(FiberState::Ready);
        worker.schedule(fiber);
    }
    info.waiters.set(ptr::null_mut());
}

/// Detaches the chain of sleepers due at or before `now` from the tree,
/// or null when none are due. (C-style raw tree: all nodes live on parked
/// fibers' stacks, guarded by the sleep lock.)
unsafe fn remove_due(tree: &mut *mut SleepNode, now: u64) -> *mut SleepNode {
    // Safety: caller holds the sleep lock.
    unsafe {
        let mut link: *mut *mut SleepNode = tree;
        while !(*link).is_null() {
            let node = *link;
            if !(*node).left.is_null() {
                link = &raw mut (*node).left;
            } else if (*node).wake_tick < now {
                *link = (*node).right;
                return node;
            } else {
                return ptr::null_mut();
            }
        }
        ptr::null_mut()
    }
}

/// Inserts a sleeper into the tree; same-tick sleepers chain through
/// `next`.
unsafe fn insert_sleeper(tree: &mut *mut SleepNode, node: *mut SleepNode) {
    // Safety: caller holds the sleep lock.
    unsafe {
        let mut link: *mut *mut SleepNode = tree;
        while !(*link).is_null() {
            let cur = *link;
            if (*node).wake_tick < (*cur).wake_tick {
                link = &raw mut (*cur).left;
            } else if (*node).wake_tick == (*cur).wake_tick {
                (*node).next = (*cur).next;
                (*cur).next = node;
                return;
            } else {
                link = &raw mut (*cur).right;
            }
        }
        *link = node;
    }
}

/// Registers the current fiber as a one-shot waiter on `fd` and suspends
/// until the descriptor is ready for the requested operations.
///
/// # Errors
///
/// [`Error::DescriptorClosed`] when [`fd_closed`] fired while waiting;
/// [`Error::InvalidArgument`] for an out-of-range descriptor;
/// [`Error::NotARuntimeThread`] off-runtime.
pub fn wait_for_event(fd: RawFd, interest: Interest) -> Result<(), Error> {
    let worker = Worker::try_current().ok_or(Error::NotARuntimeThread)?;
    let event = &worker.rt().event;

    let info = usize::try_from(fd)
        .ok()
        .and_then(|fd| event.wait_info.get(fd))
        .ok_or(Error::InvalidArgument)?;

    info.lock.lock();

    let mut events = info.events.get();
    if interest.contains(Interest::READ) {
        events |= libc::EPOLLIN as u32;
    }
    if interest.contains(Interest::WRITE) {
        events |= libc::EPOLLOUT as u32;
    }
    info.events.set(events);
    event.arm(fd, events, info.added.replace(true));

    WorkerStats::bump(&worker.stats().event_waits);

    let fiber = worker.current_fiber();
    // Safety: `fiber` is the running fiber.
    let f = unsafe { fiber.as_ref() };
    // scratch doubles as the waiter-list link while we sleep
    f.scratch.store(info.waiters.get().cast(), Ordering::Relaxed);
    info.waiters.set(fiber.as_ptr());
    f.set_state(FiberState::Waiting);
    worker.set_deferred(Deferred::UnlockSpin(NonNull::from(&info.lock)));
    worker.yield_now();

    // the poll side leaves the wake result in scratch: 0 on readiness,
    // -1 when the fd was closed under us
    if f.scratch.swap(ptr::null_mut(), Ordering::Acquire).is_null() {
        Ok(())
    } else {
        Err(Error::DescriptorClosed)
    }
}

/// Parks the calling fiber for at least `duration`, measured in timer
/// ticks (resolution [`Config::tick`], default 5 ms).
///
/// # Panics
///
/// Panics when called off a runtime worker thread.
pub fn sleep(duration: Duration) {
    let worker = Worker::current();
    let event = &worker.rt().event;

    // round up, plus one tick because we may park mid-tick
    let ticks = duration.as_nanos().div_ceil(event.tick.as_nanos().max(1)) as u64 + 1;

    let mut node = SleepNode {
        wake_tick: 0,
        fiber: Some(worker.current_fiber()),
        next: ptr::null_mut(),
        left: ptr::null_mut(),
        right: ptr::null_mut(),
    };

    event.sleep_lock.lock();
    // Safety: guarded by sleep_lock; the node lives on this (parked)
    // fiber's stack until the tick handler detaches it.
    unsafe {
        node.wake_tick = *event.tick_count.get() + ticks;
        insert_sleeper(&mut *event.sleepers.get(), &raw mut node);
    }

    let fiber = worker.current_fiber();
    // Safety: `fiber` is the running fiber.
    let f = unsafe { fiber.as_ref() };
    f.set_state(FiberState::Waiting);
    worker.set_deferred(Deferred::UnlockSpin(NonNull::from(&event.sleep_lock)));
    worker.yield_now();
}

/// Notifies the bridge that `fd` has been closed: all waiters wake with
/// [`Error::DescriptorClosed`] and the registration is dropped. Called by
/// [`io::close`](crate::io::close); callers closing descriptors behind
/// the runtime's back should invoke it themselves.
pub fn fd_closed(fd: RawFd) {
    if let Some(worker) = Worker::try_current() {
        worker.rt().event.fd_closed(fd);
    }
}
