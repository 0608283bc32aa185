//! Receiving from several channels at once.

use crate::channel::{BoundedChannel, SpChannel, UnboundedChannel};
use crate::error::Error;
use crate::sync::Signal;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

/// A channel a [`Selector`] can poll: non-blocking receive plus the
/// identity of the wake-up signal it raises.
pub trait Select<T> {
    fn try_select(&self) -> Option<T>;

    #[doc(hidden)]
    fn signal_ptr(&self) -> Option<*const Signal>;
}

impl<T: Send> Select<T> for BoundedChannel<T> {
    fn try_select(&self) -> Option<T> {
        self.try_recv()
    }

    fn signal_ptr(&self) -> Option<*const Signal> {
        BoundedChannel::signal_ptr(self)
    }
}

impl<T: Send> Select<T> for UnboundedChannel<T> {
    fn try_select(&self) -> Option<T> {
        self.try_recv()
    }

    fn signal_ptr(&self) -> Option<*const Signal> {
        UnboundedChannel::signal_ptr(self)
    }
}

impl<T: Send> Select<T> for SpChannel<T> {
    fn try_select(&self) -> Option<T> {
        self.try_recv()
    }

    fn signal_ptr(&self) -> Option<*const Signal> {
        SpChannel::signal_ptr(self)
    }
}

/// Round-robin receive over homogeneous channels sharing one signal.
///
/// Each `select` resumes polling after the channel that delivered last,
/// so a busy channel cannot shadow its peers; when every channel is empty
/// the selector parks on the shared signal, which any channel's send
/// raises.
pub struct Selector<T, C> {
    signal: Arc<Signal>,
    channels: Vec<Arc<C>>,
    next: Cell<usize>,
    _marker: PhantomData<fn() -> T>,
}

// === impl Selector ===

impl<T, C: Select<T>> Selector<T, C> {
    /// Builds a selector over `channels`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] when `channels` is empty or any channel
    /// does not raise `signal`.
    pub fn new(signal: Arc<Signal>, channels: Vec<Arc<C>>) -> Result<Self, Error> {
        if channels.is_empty() {
            return Err(Error::InvalidArgument);
        }
        for channel in &channels {
            if channel.signal_ptr() != Some(Arc::as_ptr(&signal)) {
                return Err(Error::InvalidArgument);
            }
        }
        Ok(Self {
            signal,
            channels,
            next: Cell::new(0),
            _marker: PhantomData,
        })
    }

    /// Receives from whichever channel has a message, blocking on the
    /// shared signal when all are empty.
    pub fn select(&self) -> T {
        loop {
            if let Some(message) = self.try_select() {
                return message;
            }
            self.signal.wait();
        }
    }

    /// One non-blocking round across all channels.
    pub fn try_select(&self) -> Option<T> {
        let len = self.channels.len();
        let start = self.next.get();
        for i in 0..len {
            let index = (start + i) % len;
            if let Some(message) = self.channels[index].try_select() {
                self.next.set((index + 1) % len);
                return Some(message);
            }
        }
        None
    }
}
