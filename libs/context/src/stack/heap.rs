use crate::{ContextError, STACK_ALIGNMENT};
use std::alloc::{self, Layout};

/// A plain heap-allocated stack. Cheaper to create than an
/// [`MmapStack`](super::MmapStack) but without a guard page — an overrun
/// silently corrupts the heap, so this is for workloads that control
/// their stack depth.
pub struct HeapStack {
    base: *mut u8,
    layout: Layout,
}

// === impl HeapStack ===

impl HeapStack {
    pub fn new(size: usize) -> Result<Self, ContextError> {
        // Round up so the top stays aligned.
        let size = size
            .checked_add(STACK_ALIGNMENT - 1)
            .ok_or(ContextError::InvalidArgument)?
            & !(STACK_ALIGNMENT - 1);
        let layout = Layout::from_size_align(size, STACK_ALIGNMENT)
            .map_err(|_| ContextError::InvalidArgument)?;

        // Safety: layout has non-zero size (MIN_STACK_SIZE was applied by
        // the caller).
        let base = unsafe { alloc::alloc(layout) };
        if base.is_null() {
            return Err(ContextError::OutOfMemory);
        }
        Ok(Self { base, layout })
    }

    pub fn top(&self) -> usize {
        self.base as usize + self.layout.size()
    }
}

impl Drop for HeapStack {
    fn drop(&mut self) {
        // Safety: allocated in `new` with this exact layout.
        unsafe { alloc::dealloc(self.base, self.layout) };
    }
}

// Safety: the stack is just owned memory; execution affinity is managed by
// `Context`.
unsafe impl Send for HeapStack {}
