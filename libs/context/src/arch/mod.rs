cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::{STACK_ALIGNMENT, init_stack, switch};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::{STACK_ALIGNMENT, init_stack, switch};
    } else {
        compile_error!("weft-context: unsupported target architecture");
    }
}

/// Helper to push a value onto a stack being initialised.
#[inline]
pub(crate) unsafe fn push(sp: &mut usize, val: usize) {
    // Safety: ensured by caller
    unsafe {
        *sp -= size_of::<usize>();
        *(*sp as *mut usize) = val;
    }
}
