//! The unbounded channels.

use crate::fiber::yield_now;
use crate::sync::Signal;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use weft_lockfree::{MpscFifo, Node, SpscFifo};

/// An unbounded channel: many senders, one receiver, strict global FIFO
/// over completed sends.
///
/// `send` allocates a message node; [`UnboundedChannel::send_node`] is
/// allocation-free given a caller-owned node, and
/// [`UnboundedChannel::recv_node`] hands the (rotated) node back so a
/// fixed set can circulate.
///
/// Without a signal, `recv` busy-polls the queue (it does not yield);
/// construct with [`UnboundedChannel::with_signal`] when the receiver
/// should sleep.
pub struct UnboundedChannel<T> {
    queue: MpscFifo<T>,
    ready_signal: Option<Arc<Signal>>,
    /// Guards the queue's single-consumer end against accidental
    /// concurrent receivers.
    receiving: AtomicBool,
}

// === impl UnboundedChannel ===

impl<T: Send> UnboundedChannel<T> {
    /// A channel that busy-yields on receive instead of sleeping.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A channel whose receiver sleeps on `signal`.
    pub fn with_signal(signal: Arc<Signal>) -> Self {
        Self::build(Some(signal))
    }

    fn build(ready_signal: Option<Arc<Signal>>) -> Self {
        Self {
            queue: MpscFifo::new(),
            ready_signal,
            receiving: AtomicBool::new(false),
        }
    }

    /// Sends a message; never blocks. Returns whether the receiver was
    /// woken.
    pub fn send(&self, message: T) -> bool {
        self.send_node(Box::new(Node::new(message)))
    }

    /// Sends a caller-owned node; the channel owns it afterwards.
    pub fn send_node(&self, node: Box<Node<T>>) -> bool {
        self.queue.push(node);
        if let Some(signal) = &self.ready_signal {
            return signal.raise();
        }
        false
    }

    /// Receives the oldest message, blocking until one arrives.
    pub fn recv(&self) -> T {
        // Safety: node just popped, exclusively owned.
        unsafe { self.recv_node().take() }.expect("channel node without message")
    }

    /// As [`UnboundedChannel::recv`], but hands the node back to the
    /// caller for reuse.
    pub fn recv_node(&self) -> Box<Node<T>> {
        loop {
            if let Some(node) = self.pop_guarded() {
                return node;
            }
            if let Some(signal) = &self.ready_signal {
                signal.wait();
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<T> {
        // Safety: node just popped, exclusively owned.
        self.pop_guarded().map(|node| unsafe { node.take() }.expect("channel node without message"))
    }

    fn pop_guarded(&self) -> Option<Box<Node<T>>> {
        while self
            .receiving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // a second receiver - not the intended use, but stay safe
            yield_now();
        }
        // Safety: the flag serialises consumers.
        let node = unsafe { self.queue.try_pop() };
        self.receiving.store(false, Ordering::Release);
        node
    }

    pub(crate) fn signal_ptr(&self) -> Option<*const Signal> {
        self.ready_signal.as_deref().map(ptr::from_ref)
    }
}

impl<T: Send> Default for UnboundedChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The single-producer unbounded channel: one sender, one receiver,
/// wait-free on both ends, strict FIFO.
pub struct SpChannel<T> {
    queue: SpscFifo<T>,
    ready_signal: Option<Arc<Signal>>,
    sending: AtomicBool,
    receiving: AtomicBool,
}

// === impl SpChannel ===

impl<T: Send> SpChannel<T> {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_signal(signal: Arc<Signal>) -> Self {
        Self::build(Some(signal))
    }

    fn build(ready_signal: Option<Arc<Signal>>) -> Self {
        Self {
            queue: SpscFifo::new(),
            ready_signal,
            sending: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
        }
    }

    /// Sends a message; never blocks. Returns whether the receiver was
    /// woken.
    pub fn send(&self, message: T) -> bool {
        self.send_node(Box::new(Node::new(message)))
    }

    pub fn send_node(&self, node: Box<Node<T>>) -> bool {
        while self
            .sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            yield_now();
        }
        // Safety: the flag serialises producers.
        unsafe { self.queue.push(node) };
        self.sending.store(false, Ordering::Release);

        if let Some(signal) = &self.ready_signal {
            return signal.raise();
        }
        false
    }

    pub fn recv(&self) -> T {
        // Safety: node just popped, exclusively owned.
        unsafe { self.recv_node().take() }.expect("channel node without message")
    }

    pub fn recv_node(&self) -> Box<Node<T>> {
        loop {
            if let Some(node) = self.pop_guarded() {
                return node;
            }
            if let Some(signal) = &self.ready_signal {
                signal.wait();
            }
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        // Safety: node just popped, exclusively owned.
        self.pop_guarded().map(|node| unsafe { node.take() }.expect("channel node without message"))
    }

    fn pop_guarded(&self) -> Option<Box<Node<T>>> {
        while self
            .receiving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            yield_now();
        }
        // Safety: the flag serialises consumers.
        let node = unsafe { self.queue.try_pop() };
        self.receiving.store(false, Ordering::Release);
        node
    }

    pub(crate) fn signal_ptr(&self) -> Option<*const Signal> {
        self.ready_signal.as_deref().map(ptr::from_ref)
    }
}

impl<T: Send> Default for SpChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}
