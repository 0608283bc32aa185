cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod mmap;
        pub use mmap::MmapStack;
    } else {
        compile_error!("weft-context: only unix targets are supported");
    }
}

mod heap;
pub use heap::HeapStack;

/// Minimum size of a stack, excluding guard pages. Requests below this are
/// clamped up.
pub const MIN_STACK_SIZE: usize = 1024;
