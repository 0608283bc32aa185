use crate::ContextError;
use core::ptr;

/// An `mmap`-backed stack with one `PROT_NONE` guard page at the low end.
///
/// The whole mapping is reserved `PROT_NONE` first and everything except
/// the lowest page is then made read-write, so an overrun faults on the
/// guard page instead of scribbling over a neighbouring allocation.
pub struct MmapStack {
    top: usize,
    mmap_len: usize,
}

// === impl MmapStack ===

impl MmapStack {
    /// Maps a stack with at least `size` usable bytes (page-rounded, plus
    /// the guard page).
    pub fn new(size: usize) -> Result<Self, ContextError> {
        let page_size = page_size();

        // Round the usable size up to a page boundary and add the guard.
        let size = size
            .checked_add(page_size - 1)
            .ok_or(ContextError::InvalidArgument)?
            & !(page_size - 1);
        let mmap_len = size
            .checked_add(page_size)
            .ok_or(ContextError::InvalidArgument)?;

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        // Safety: anonymous mapping, no aliasing concerns.
        unsafe {
            let mmap = libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_NONE,
                map_flags,
                -1,
                0,
            );
            if mmap == libc::MAP_FAILED {
                return Err(ContextError::OutOfMemory);
            }

            // Constructed here so the mapping is released if mprotect
            // fails below.
            let out = Self {
                top: mmap as usize + mmap_len,
                mmap_len,
            };

            // Everything except the guard page becomes writable.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(ContextError::OutOfMemory);
            }

            Ok(out)
        }
    }

    /// Highest address of the stack; `STACK_ALIGNMENT`-aligned because the
    /// mapping is page-aligned.
    pub fn top(&self) -> usize {
        self.top
    }
}

impl Drop for MmapStack {
    fn drop(&mut self) {
        // Safety: unmapping the exact region mapped in `new`.
        unsafe {
            let mmap = self.top - self.mmap_len;
            let ret = libc::munmap(mmap as *mut _, self.mmap_len);
            debug_assert_eq!(ret, 0);
        }
    }
}

fn page_size() -> usize {
    // Safety: sysconf is always safe to call.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = usize::try_from(page_size).expect("negative page size");
    assert!(page_size.is_power_of_two());
    page_size
}
