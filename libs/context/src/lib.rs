//! The stackful context-switch primitive underneath weft's fibers.
//!
//! A [`Context`] is an owned stack plus the saved stack pointer of a
//! suspended execution. [`Context::swap`] is a *symmetric* transfer: it
//! saves the callee-saved register state and a resume address on the
//! current stack, publishes the stack pointer into `from`, and resumes
//! `to` wherever it last suspended (or at its entry trampoline if it has
//! never run).
//!
//! The register save/restore lives in a small per-architecture assembly
//! kernel (`src/arch/`); the asm idiom follows [`corosensei`]-style
//! switching: only the LLVM-reserved registers are saved by hand, the rest
//! are spilled by the compiler through the clobber list.
//!
//! [`corosensei`]: https://github.com/Amanieu/corosensei

mod arch;
pub mod stack;

use crate::stack::{HeapStack, MmapStack};
use core::fmt;

pub use crate::arch::STACK_ALIGNMENT;
pub use crate::stack::MIN_STACK_SIZE;

/// The function a fresh context starts in. Receives the opaque argument
/// given to [`Context::new`] and must never return — a context that is
/// done transfers away one final time instead.
pub type EntryPoint = unsafe extern "C" fn(arg: usize) -> !;

/// Stack allocation strategy for a new context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackKind {
    /// `mmap`-backed with one `PROT_NONE` guard page below the stack.
    /// Overruns fault instead of corrupting adjacent memory.
    #[default]
    Mmap,
    /// Plain heap allocation. No guard page, no syscalls.
    Heap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// Stack allocation failed.
    OutOfMemory,
    /// Malformed request (e.g. zero-sized stack on a platform where that
    /// cannot be rounded up).
    InvalidArgument,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::OutOfMemory => f.write_str("stack allocation failed"),
            ContextError::InvalidArgument => f.write_str("invalid context argument"),
        }
    }
}

impl std::error::Error for ContextError {}

enum StackStorage {
    Mmap(MmapStack),
    Heap(HeapStack),
    /// A context wrapping the OS thread that created it. Owns no stack and
    /// must never free one.
    Thread,
}

pub struct Context {
    stack: StackStorage,
    /// Saved stack pointer while suspended. Meaningless while the context
    /// is running — it is rewritten on every suspension.
    stack_ptr: usize,
}

// === impl Context ===

impl Context {
    /// Creates a suspended context over a freshly allocated stack of at
    /// least `stack_size` bytes; the first [`Context::swap`] into it calls
    /// `entry(arg)`.
    ///
    /// # Errors
    ///
    /// [`ContextError::OutOfMemory`] when the stack cannot be allocated.
    pub fn new(
        stack_size: usize,
        kind: StackKind,
        entry: EntryPoint,
        arg: usize,
    ) -> Result<Self, ContextError> {
        let stack_size = stack_size.max(MIN_STACK_SIZE);

        let (storage, top) = match kind {
            StackKind::Mmap => {
                let stack = MmapStack::new(stack_size)?;
                let top = stack.top();
                (StackStorage::Mmap(stack), top)
            }
            StackKind::Heap => {
                let stack = HeapStack::new(stack_size)?;
                let top = stack.top();
                (StackStorage::Heap(stack), top)
            }
        };

        debug_assert_eq!(top % STACK_ALIGNMENT, 0);
        // Safety: `top` is the aligned top of a stack we own.
        let stack_ptr = unsafe { arch::init_stack(top, entry, arg) };

        Ok(Self {
            stack: storage,
            stack_ptr,
        })
    }

    /// Wraps the calling OS thread in a context so it can be suspended
    /// like any fiber. The thread keeps its own stack; dropping the
    /// returned context frees nothing.
    pub fn from_thread() -> Self {
        Self {
            stack: StackStorage::Thread,
            stack_ptr: 0,
        }
    }

    /// Suspends the current execution into `from` and resumes `to`.
    ///
    /// Returns when something later swaps back into `from` — possibly on a
    /// different OS thread.
    ///
    /// # Safety
    ///
    /// `to` must be a suspended context (fresh, or previously saved by a
    /// swap) and no other thread may be resuming it concurrently. `from`
    /// must be the context of the currently running execution.
    #[inline]
    pub unsafe fn swap(from: *mut Context, to: *const Context) {
        // Safety: contract passed through to the caller.
        unsafe { arch::switch(&raw mut (*from).stack_ptr, (*to).stack_ptr) }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.stack {
            StackStorage::Mmap(_) => "mmap",
            StackStorage::Heap(_) => "heap",
            StackStorage::Thread => "thread",
        };
        f.debug_struct("Context")
            .field("stack", &kind)
            .field("stack_ptr", &(self.stack_ptr as *const ()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    thread_local! {
        static MAIN: Cell<*mut Context> = const { Cell::new(std::ptr::null_mut()) };
        static FIBER: Cell<*mut Context> = const { Cell::new(std::ptr::null_mut()) };
        static TRACE: Cell<u32> = const { Cell::new(0) };
    }

    unsafe extern "C" fn entry(arg: usize) -> ! {
        assert_eq!(arg, 0xfeed);
        for _ in 0..3 {
            TRACE.with(|t| t.set(t.get() + 1));
            // Safety: single-threaded ping-pong between two live contexts.
            unsafe { Context::swap(FIBER.with(Cell::get), MAIN.with(Cell::get)) };
        }
        unreachable!("resumed a completed context");
    }

    fn ping_pong(kind: StackKind) {
        let mut main = Context::from_thread();
        let mut fiber = Context::new(64 * 1024, kind, entry, 0xfeed).unwrap();
        MAIN.with(|c| c.set(&raw mut main));
        FIBER.with(|c| c.set(&raw mut fiber));
        TRACE.with(|t| t.set(0));

        for i in 1..=3 {
            // Safety: `fiber` is suspended, `main` is running.
            unsafe { Context::swap(&raw mut main, &raw const fiber) };
            assert_eq!(TRACE.with(Cell::get), i);
        }
        // the fiber is now parked inside its final swap; dropping it only
        // frees the stack
    }

    #[test]
    fn ping_pong_mmap() {
        ping_pong(StackKind::Mmap);
    }

    #[test]
    fn ping_pong_heap() {
        ping_pong(StackKind::Heap);
    }
}
