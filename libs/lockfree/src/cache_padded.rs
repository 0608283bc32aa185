use core::ops::{Deref, DerefMut};

/// Gives `T` a cache line of its own, so two hot atomics (say, a queue's
/// head and tail) don't [false-share] a line and invalidate each other on
/// every write.
///
/// weft targets x86_64 and aarch64: x86_64 prefetches line *pairs* since
/// Sandy Bridge and aarch64 big cores use 128-byte lines, so both align
/// to 128 bytes. Anything else gets the common 64.
///
/// [false-share]: https://en.wikipedia.org/wiki/False_sharing
#[cfg_attr(
    any(target_arch = "x86_64", target_arch = "aarch64"),
    repr(align(128))
)]
#[cfg_attr(
    not(any(target_arch = "x86_64", target_arch = "aarch64")),
    repr(align(64))
)]
#[derive(Debug, Default)]
pub struct CachePadded<T> {
    value: T,
}

// === impl CachePadded ===

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}
