//! Fiber objects and their lifecycle: spawn, run, exit, join, detach,
//! recycle.
//!
//! A [`Fiber`] is manually managed (`NonNull`) because its ownership walks
//! through machinery the borrow checker cannot see: it lives in run
//! queues, wait queues and the free-fiber pool, and is destroyed by
//! whichever worker performs the post-swap maintenance after it exits.

use crate::error::Error;
use crate::runtime::RuntimeInner;
use crate::worker::{self, Deferred, Worker};
use std::any::Any;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU64, Ordering};
use weft_context::{Context, StackKind};
use weft_lockfree::Node;

/// A raw fiber reference, passed through run queues, wait queues and the
/// free pool. Copyable and pointer-sized so the lock-free structures can
/// carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FiberRef(NonNull<Fiber>);

// Safety: the pointee is `Sync` and its lifecycle protocol governs who may
// dereference when.
unsafe impl Send for FiberRef {}
unsafe impl Sync for FiberRef {}

impl FiberRef {
    /// # Safety
    ///
    /// `ptr` must point to a live `Fiber`.
    pub(crate) unsafe fn new_unchecked(ptr: *mut Fiber) -> Self {
        // Safety: per the contract.
        Self(unsafe { NonNull::new_unchecked(ptr) })
    }

    #[inline]
    pub(crate) fn as_ptr(self) -> *mut Fiber {
        self.0.as_ptr()
    }

    /// # Safety
    ///
    /// The fiber must still be live; the caller chooses the lifetime.
    #[inline]
    pub(crate) unsafe fn as_ref<'a>(&self) -> &'a Fiber {
        // Safety: per the contract.
        unsafe { self.0.as_ref() }
    }
}

/// The pre-allocated node a fiber parks itself with. Carried by the fiber
/// whenever it is not enqueued in a wait queue, so suspension never
/// allocates.
pub(crate) type WaitNode = Node<FiberRef>;

/// Type-erased fiber output. Double-boxed so the pointer stays thin.
type ErasedResult = Box<dyn Any + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FiberState {
    Running = 1,
    Ready,
    Waiting,
    Done,
    /// Between publishing itself to a wait queue and leaving its stack.
    /// A fiber observed in this state must not be run yet; the scheduler
    /// re-queues it and post-swap maintenance commits it to `Waiting`.
    SavingStateToWait,
}

pub(crate) const DETACH_NONE: u8 = 0;
pub(crate) const DETACH_WAIT_FOR_JOINER: u8 = 1;
pub(crate) const DETACH_WAIT_TO_JOIN: u8 = 2;
pub(crate) const DETACH_DETACHED: u8 = 3;

pub(crate) struct Fiber {
    state: AtomicU8,
    detach_state: AtomicU8,
    /// Bumped on every (re)allocation; join handles carry a copy so a
    /// handle to a recycled fiber is detectable.
    pub(crate) generation: AtomicU64,
    /// The erased output, owned by this slot until a joiner takes it.
    result: AtomicPtr<()>,
    /// Private per-primitive state while Waiting or Ready; never touched
    /// while Running. Signals park their ready-to-wake sentinel here, the
    /// event bridge threads its waiter lists through it.
    pub(crate) scratch: AtomicPtr<()>,
    /// Single-writer rendezvous cell for the join/detach protocol.
    pub(crate) join_info: AtomicPtr<()>,
    wait_node: AtomicPtr<WaitNode>,
    context: UnsafeCell<Context>,
    entry: UnsafeCell<Option<Box<dyn FnOnce() -> *mut () + Send>>>,
    is_thread: bool,
    /// Thread-bootstrap fibers are pinned to the worker whose OS thread
    /// they wrap: they only ever run on their home worker, delivered
    /// through its inbox rather than the stealable run queues. (Their
    /// stack *is* the OS thread's stack, and teardown must hand every
    /// thread back to its original caller.)
    home: usize,
}

// Safety: every field is either atomic, immutable after construction, or
// guarded by the lifecycle protocol (`context` and `entry` are only
// touched by the worker that currently observes the fiber as Running, and
// exactly one worker can).
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

// === impl Fiber ===

impl Fiber {
    fn new_boxed(is_thread: bool, home: usize, state: FiberState) -> FiberRef {
        let fiber = Box::new(Fiber {
            state: AtomicU8::new(state as u8),
            detach_state: AtomicU8::new(DETACH_NONE),
            generation: AtomicU64::new(0),
            result: AtomicPtr::new(ptr::null_mut()),
            scratch: AtomicPtr::new(ptr::null_mut()),
            join_info: AtomicPtr::new(ptr::null_mut()),
            wait_node: AtomicPtr::new(Box::into_raw(Box::new(Node::empty()))),
            context: UnsafeCell::new(Context::from_thread()),
            entry: UnsafeCell::new(None),
            is_thread,
            home,
        });
        FiberRef(NonNull::from(Box::leak(fiber)))
    }

    /// Creates (or recycles) a runnable fiber. The caller schedules it.
    pub(crate) fn allocate(
        rt: &RuntimeInner,
        stack_size: usize,
        kind: StackKind,
        entry: Box<dyn FnOnce() -> *mut () + Send>,
    ) -> Result<FiberRef, Error> {
        let fiber = match rt.free_fibers.try_pop() {
            Some(node) => {
                // Safety: pooled nodes carry their fiber and are owned by
                // us after the pop.
                let fiber = unsafe { node.take() }.expect("pooled node without fiber");
                // Safety: pooled fibers are quiescent.
                unsafe { fiber.as_ref() }.restore_wait_node(node);
                fiber
            }
            None => Self::new_boxed(false, 0, FiberState::Ready),
        };

        // Safety: not yet visible to any other thread.
        let f = unsafe { fiber.as_ref() };
        f.state.store(FiberState::Ready as u8, Ordering::Relaxed);
        f.detach_state.store(DETACH_NONE, Ordering::Relaxed);
        f.result.store(ptr::null_mut(), Ordering::Relaxed);
        f.scratch.store(ptr::null_mut(), Ordering::Relaxed);
        f.join_info.store(ptr::null_mut(), Ordering::Relaxed);
        f.generation.fetch_add(1, Ordering::Release);

        match Context::new(stack_size, kind, fiber_entry, fiber.as_ptr() as usize) {
            Ok(context) => {
                // Safety: exclusive access; replacing frees a recycled
                // fiber's previous stack.
                unsafe {
                    *f.context.get() = context;
                    *f.entry.get() = Some(entry);
                }
                Ok(fiber)
            }
            Err(err) => {
                // Safety: never published, safe to free.
                unsafe { Self::destroy(fiber) };
                Err(err.into())
            }
        }
    }

    /// Wraps the calling OS thread in a fiber (state Running), pinned to
    /// worker `home`.
    pub(crate) fn create_from_thread(home: usize) -> FiberRef {
        let fiber = Self::new_boxed(true, home, FiberState::Running);
        // Safety: not yet shared.
        unsafe { fiber.as_ref() }.generation.store(1, Ordering::Release);
        fiber
    }

    /// Frees a fiber outright: stack, wait node, unclaimed result.
    ///
    /// # Safety
    ///
    /// The fiber must be Done (or a thread fiber at shutdown) and
    /// unreachable from any queue.
    pub(crate) unsafe fn destroy(fiber: FiberRef) {
        // Safety: exclusive ownership per the contract.
        unsafe {
            let f = Box::from_raw(fiber.as_ptr());
            let node = f.wait_node.swap(ptr::null_mut(), Ordering::Relaxed);
            if !node.is_null() {
                drop(Box::from_raw(node));
            }
            let result = f.result.swap(ptr::null_mut(), Ordering::Relaxed);
            if !result.is_null() {
                drop(Box::from_raw(result.cast::<ErasedResult>()));
            }
            // the context (and its stack) drops with the box
        }
    }

    /// Retires a Done fiber into the runtime's free-fiber LIFO for reuse,
    /// parked on its own wait node. Thread fibers are freed outright.
    ///
    /// # Safety
    ///
    /// Same contract as [`Fiber::destroy`].
    pub(crate) unsafe fn retire(rt: &RuntimeInner, fiber: FiberRef) {
        // Safety: exclusive ownership per the contract.
        unsafe {
            let f = fiber.as_ref();
            if f.is_thread {
                Self::destroy(fiber);
                return;
            }
            let result = f.result.swap(ptr::null_mut(), Ordering::Relaxed);
            if !result.is_null() {
                drop(Box::from_raw(result.cast::<ErasedResult>()));
            }
            let node = f.take_wait_node();
            node.put(fiber);
            rt.free_fibers.push(node);
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> FiberState {
        match self.state.load(Ordering::Acquire) {
            1 => FiberState::Running,
            2 => FiberState::Ready,
            3 => FiberState::Waiting,
            4 => FiberState::Done,
            5 => FiberState::SavingStateToWait,
            _ => unreachable!("corrupt fiber state"),
        }
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_thread(&self) -> bool {
        self.is_thread
    }

    #[inline]
    pub(crate) fn home(&self) -> usize {
        self.home
    }

    pub(crate) fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }

    /// Detaches the fiber's spare wait node for a queue push.
    pub(crate) fn take_wait_node(&self) -> Box<WaitNode> {
        let node = self.wait_node.swap(ptr::null_mut(), Ordering::AcqRel);
        assert!(!node.is_null(), "fiber's wait node already in use");
        // Safety: the swap took sole ownership.
        unsafe { Box::from_raw(node) }
    }

    /// Re-attaches a (rotated) wait node after a wake.
    pub(crate) fn restore_wait_node(&self, node: Box<WaitNode>) {
        let prev = self.wait_node.swap(Box::into_raw(node), Ordering::AcqRel);
        debug_assert!(prev.is_null(), "fiber already owns a wait node");
    }

    /// Takes the entry closure; runs once per (re)allocation.
    fn take_entry(&self) -> Option<Box<dyn FnOnce() -> *mut () + Send>> {
        // Safety: only the worker running this fiber gets here.
        unsafe { (*self.entry.get()).take() }
    }
}

/// Every fiber starts here (see `Context::new` in `Fiber::allocate`).
unsafe extern "C" fn fiber_entry(arg: usize) -> ! {
    // Safety: `arg` is the fiber pointer installed by `allocate`.
    let fiber = unsafe { FiberRef::new_unchecked(arg as *mut Fiber) };

    // Maintenance normally runs right after a context swap; a fresh fiber
    // arrives here instead of after a swap, so it runs it first thing.
    Worker::current().do_maintenance();

    // Safety: we are the running fiber.
    let entry = unsafe { fiber.as_ref() }
        .take_entry()
        .expect("fiber resumed without an entry function");
    let result = entry();

    // Safety: `fiber` is the current fiber and `result` is owned.
    unsafe { exit_routine(fiber, result) }
}

/// The exit path: publish the result, settle the join/detach rendezvous,
/// hand the fiber to post-swap maintenance for destruction.
///
/// # Safety
///
/// Must run on `fiber` itself, with `result` an owned erased-result
/// pointer (or null).
pub(crate) unsafe fn exit_routine(fiber: FiberRef, result: *mut ()) -> ! {
    // Safety: we are the running fiber.
    let f = unsafe { fiber.as_ref() };
    // the result must be visible before the state changes
    f.result.store(result, Ordering::Release);

    if f.detach_state.load(Ordering::Acquire) != DETACH_DETACHED {
        let old = f.detach_state.swap(DETACH_WAIT_FOR_JOINER, Ordering::AcqRel);
        if old == DETACH_NONE {
            // no joiner yet - publish ourselves and wait for one
            worker::set_and_wait(&f.join_info, fiber.as_ptr().cast());
        } else if old == DETACH_WAIT_TO_JOIN {
            // the joining fiber is parked; hand the result across and wake it
            let joiner = worker::clear_or_wait(&f.join_info);
            // Safety: only fiber pointers are published into join_info.
            let joiner = unsafe { FiberRef::new_unchecked(joiner.cast()) };
            let jf = unsafe { joiner.as_ref() };
            jf.result
                .store(f.result.swap(ptr::null_mut(), Ordering::AcqRel), Ordering::Release);
            jf.set_state(FiberState::Ready);
            Worker::current().schedule(joiner);
        }
    }

    f.set_state(FiberState::Done);

    let worker = Worker::current();
    worker.set_deferred(Deferred::Destroy(fiber));
    worker.yield_now();
    unreachable!("completed fiber resumed");
}

/// Joins a fiber by raw reference: parks until it exits, returns the
/// erased result pointer. Null means the fiber was detached concurrently.
pub(crate) fn join_raw(fiber: FiberRef) -> Result<*mut (), Error> {
    let worker = Worker::try_current().ok_or(Error::NotARuntimeThread)?;
    // Safety: the caller vouches the fiber is alive (generation-checked in
    // the public wrapper).
    let f = unsafe { fiber.as_ref() };

    if f.detach_state.load(Ordering::Acquire) == DETACH_DETACHED {
        return Err(Error::InvalidState);
    }

    let old = f.detach_state.swap(DETACH_WAIT_TO_JOIN, Ordering::AcqRel);
    match old {
        DETACH_NONE => {
            // need to wait until the fiber finishes
            let me = worker.current_fiber();
            worker::set_and_wait(&f.join_info, me.as_ptr().cast());
            // the exiting fiber deposited its result in *our* slot
            // Safety: `me` is our own fiber.
            let result = unsafe { me.as_ref() }
                .result
                .swap(ptr::null_mut(), Ordering::AcqRel);
            if result.is_null() {
                return Err(Error::InvalidState);
            }
            Ok(result)
        }
        DETACH_WAIT_FOR_JOINER => {
            // the fiber finished first and parked itself
            let result = f.result.swap(ptr::null_mut(), Ordering::AcqRel);
            let exiting = worker::clear_or_wait(&f.join_info);
            // Safety: only fiber pointers are published into join_info.
            let exiting = unsafe { FiberRef::new_unchecked(exiting.cast()) };
            unsafe { exiting.as_ref() }.set_state(FiberState::Ready);
            // clear_or_wait may have yielded; the worker can have changed
            Worker::current().schedule(exiting);
            if result.is_null() {
                return Err(Error::InvalidState);
            }
            Ok(result)
        }
        _ => Err(Error::InvalidState),
    }
}

pub(crate) fn detach_raw(fiber: FiberRef) -> Result<(), Error> {
    Worker::try_current().ok_or(Error::NotARuntimeThread)?;
    // Safety: caller vouches for liveness.
    let f = unsafe { fiber.as_ref() };

    let old = f.detach_state.swap(DETACH_DETACHED, Ordering::AcqRel);
    if old == DETACH_WAIT_FOR_JOINER || old == DETACH_WAIT_TO_JOIN {
        // wake whichever side is parked: the finished fiber, or (as a
        // convenience) a fiber that was trying to join it
        let parked = worker::clear_or_wait(&f.join_info);
        // Safety: only fiber pointers are published into join_info.
        let parked = unsafe { FiberRef::new_unchecked(parked.cast()) };
        unsafe { parked.as_ref() }.set_state(FiberState::Ready);
        Worker::current().schedule(parked);
    } else if old == DETACH_DETACHED {
        return Err(Error::InvalidState);
    }
    Ok(())
}

/// An owned permission to join or detach a spawned fiber.
///
/// Dropping the handle detaches the fiber (like [`std::thread`] — the
/// fiber's exit no longer has to rendezvous with anyone).
pub struct JoinHandle<T> {
    fiber: FiberRef,
    generation: u64,
    rt: Arc<RuntimeInner>,
    _marker: PhantomData<fn() -> T>,
}

// Safety: the handle only touches the fiber through the atomic
// join/detach protocol.
unsafe impl<T: Send> Send for JoinHandle<T> {}

// === impl JoinHandle ===

impl<T: 'static> JoinHandle<T> {
    /// Blocks the calling fiber until the target exits and returns its
    /// output. If the fiber panicked, the panic is resumed here.
    ///
    /// # Errors
    ///
    /// [`Error::NotARuntimeThread`] off-runtime; [`Error::InvalidState`]
    /// when the handle is stale (the fiber was recycled) or the fiber was
    /// detached concurrently.
    pub fn join(self) -> Result<T, Error> {
        let this = ManuallyDrop::new(self);
        this.check()?;
        let result = join_raw(this.fiber)?;
        // Safety: `result` came out of this fiber's exit path.
        Ok(unsafe { claim_result(result) })
    }

    /// Non-blocking join: succeeds only if the fiber has already exited
    /// and parked waiting for a joiner.
    ///
    /// # Errors
    ///
    /// [`Error::WouldBlock`] while the fiber is still running (the handle
    /// comes back for a retry); [`Error::InvalidState`] for stale or
    /// detached targets.
    pub fn try_join(self) -> Result<T, (Self, Error)> {
        let this = ManuallyDrop::new(self);
        // Safety: ManuallyDrop inhibits the detach-on-drop.
        let reclaim = |this: ManuallyDrop<Self>, err| Err((ManuallyDrop::into_inner(this), err));

        if Worker::try_current().is_none() {
            return reclaim(this, Error::NotARuntimeThread);
        }
        if this.check().is_err() {
            return reclaim(this, Error::InvalidState);
        }

        // Safety: generation checked above.
        let f = unsafe { this.fiber.as_ref() };
        if f.detach_state.load(Ordering::Acquire) != DETACH_WAIT_FOR_JOINER {
            return reclaim(this, Error::WouldBlock);
        }
        // The fiber looked finished; only proceed if that still holds
        // after we atomically claim the join.
        let old = f.detach_state.swap(DETACH_WAIT_TO_JOIN, Ordering::AcqRel);
        if old != DETACH_WAIT_FOR_JOINER {
            return reclaim(this, Error::InvalidState);
        }

        let result = f.result.swap(ptr::null_mut(), Ordering::AcqRel);
        let exiting = worker::clear_or_wait(&f.join_info);
        // Safety: only fiber pointers are published into join_info.
        let exiting = unsafe { FiberRef::new_unchecked(exiting.cast()) };
        unsafe { exiting.as_ref() }.set_state(FiberState::Ready);
        Worker::current().schedule(exiting);

        if result.is_null() {
            return reclaim(this, Error::InvalidState);
        }
        // Safety: `result` came out of this fiber's exit path.
        Ok(unsafe { claim_result(result) })
    }

    /// Explicitly detaches the fiber. Equivalent to dropping the handle,
    /// but reports failure.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] when the handle is stale or the fiber was
    /// already detached.
    pub fn detach(self) -> Result<(), Error> {
        let this = ManuallyDrop::new(self);
        this.check()?;
        detach_raw(this.fiber)
    }

    fn check(&self) -> Result<(), Error> {
        let worker = Worker::try_current().ok_or(Error::NotARuntimeThread)?;
        if !Arc::ptr_eq(worker.rt(), &self.rt) {
            return Err(Error::InvalidState);
        }
        // Safety: the Arc keeps the runtime (and its fiber pool) alive;
        // a recycled fiber is caught by the generation check.
        if unsafe { self.fiber.as_ref() }.generation.load(Ordering::Acquire) != self.generation {
            return Err(Error::InvalidState);
        }
        Ok(())
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        let Some(worker) = Worker::try_current() else {
            // off-runtime there is no way to run the rendezvous; the
            // fiber stays joinable-but-never-joined
            return;
        };
        if Arc::ptr_eq(worker.rt(), &self.rt)
            // Safety: as in `check`.
            && unsafe { self.fiber.as_ref() }.generation.load(Ordering::Acquire)
                == self.generation
        {
            let _ = detach_raw(self.fiber);
        }
    }
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("fiber", &self.fiber)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Drops an erased exit-result pointer without inspecting it (used when a
/// fiber is joined purely for synchronisation, e.g. the maintenance fiber
/// at shutdown).
///
/// # Safety
///
/// `result` must be a pointer produced by a fiber's exit path, not yet
/// claimed.
pub(crate) unsafe fn discard_result(result: *mut ()) {
    if !result.is_null() {
        // Safety: per the contract.
        drop(unsafe { Box::from_raw(result.cast::<ErasedResult>()) });
    }
}

/// Turns an erased exit-result pointer back into the caller's type,
/// resuming the fiber's panic if it had one.
///
/// # Safety
///
/// `result` must be the pointer produced by the spawn closure of a fiber
/// whose output type is `T`.
unsafe fn claim_result<T: 'static>(result: *mut ()) -> T {
    // Safety: per the contract.
    let erased = unsafe { *Box::from_raw(result.cast::<ErasedResult>()) };
    let Ok(output) = erased.downcast::<std::thread::Result<T>>() else {
        unreachable!("fiber result does not carry the spawned closure's output type");
    };
    match *output {
        Ok(value) => value,
        Err(payload) => panic::resume_unwind(payload),
    }
}

/// Configures and spawns fibers; the fallible, tunable counterpart of
/// [`spawn`].
#[derive(Debug, Default, Clone)]
pub struct Builder {
    stack_size: Option<usize>,
    stack_kind: Option<StackKind>,
}

// === impl Builder ===

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Usable stack size in bytes (clamped up to the platform minimum).
    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    #[must_use]
    pub fn stack_kind(mut self, kind: StackKind) -> Self {
        self.stack_kind = Some(kind);
        self
    }

    /// Spawns a fiber running `f`, scheduled immediately on the calling
    /// worker.
    ///
    /// # Errors
    ///
    /// [`Error::NotARuntimeThread`] off-runtime, [`Error::OutOfMemory`]
    /// when the stack cannot be allocated.
    pub fn spawn<F, T>(self, f: F) -> Result<JoinHandle<T>, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let worker = Worker::try_current().ok_or(Error::NotARuntimeThread)?;
        let rt = worker.rt().clone();
        let fiber = self.spawn_unscheduled_on(&rt, f)?;
        // Safety: just allocated, not yet visible.
        let generation = unsafe { fiber.as_ref() }.generation.load(Ordering::Acquire);
        worker.schedule(fiber);
        Ok(JoinHandle {
            fiber,
            generation,
            rt,
            _marker: PhantomData,
        })
    }

    /// Creates the fiber without inserting it into a scheduler. Used for
    /// the per-worker maintenance fiber, which is only ever switched to
    /// directly.
    pub(crate) fn spawn_unscheduled_on<F, T>(
        &self,
        rt: &Arc<RuntimeInner>,
        f: F,
    ) -> Result<FiberRef, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let stack_size = self.stack_size.unwrap_or(rt.config.default_stack_size);
        let stack_kind = self.stack_kind.unwrap_or(rt.config.stack_kind);
        let entry: Box<dyn FnOnce() -> *mut () + Send> = Box::new(move || {
            let output = panic::catch_unwind(AssertUnwindSafe(f));
            let erased: ErasedResult = Box::new(output);
            Box::into_raw(Box::new(erased)).cast()
        });
        Fiber::allocate(rt, stack_size, stack_kind, entry)
    }
}

/// Spawns a fiber with the runtime's default stack settings.
///
/// # Panics
///
/// Panics when called off a runtime worker thread or when allocation
/// fails; use [`Builder::spawn`] for the fallible form.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().spawn(f).expect("failed to spawn fiber")
}

/// Cooperatively gives other runnable fibers a turn.
///
/// # Panics
///
/// Panics when called off a runtime worker thread.
pub fn yield_now() {
    Worker::current().yield_now();
}
