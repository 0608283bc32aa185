//! The single-owner work queue.

use crate::fiber::yield_now;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use weft_lockfree::{CachePadded, MpscFifo, Node};

/// Outcome of [`WorkQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    /// The caller's push was the first of a burst; the caller must now
    /// drain the queue with [`WorkQueue::get_work`] until it reports
    /// [`GetWork::Empty`].
    StartWorking,
    /// Another fiber is already working; the item will be processed.
    Queued,
}

/// Outcome of [`WorkQueue::get_work`].
#[derive(Debug)]
pub enum GetWork<T> {
    More(T),
    Empty,
}

/// A work queue that elects exactly one worker per burst: the producer
/// whose push takes `in_count` from 0 to 1 becomes the sole consumer and
/// drains everything that it and other producers queue, amortising the
/// handling of many items into one fiber.
pub struct WorkQueue<T> {
    fifo: MpscFifo<T>,
    in_count: CachePadded<AtomicI64>,
    out_count: CachePadded<AtomicI64>,
    /// Serialises accidental concurrent `get_work` callers.
    working: AtomicBool,
}

// === impl WorkQueue ===

impl<T: Send> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            fifo: MpscFifo::new(),
            in_count: CachePadded::new(AtomicI64::new(0)),
            out_count: CachePadded::new(AtomicI64::new(0)),
            working: AtomicBool::new(false),
        }
    }

    /// Queues an item. The queue owns it until handed out by
    /// [`WorkQueue::get_work`].
    pub fn push(&self, item: T) -> Push {
        self.push_node(Box::new(Node::new(item)))
    }

    /// Allocation-free push with a caller-owned node.
    pub fn push_node(&self, node: Box<Node<T>>) -> Push {
        let in_count = self.in_count.fetch_add(1, Ordering::AcqRel) + 1;
        let result = if in_count == 1 {
            // we got here first; we'll be the worker
            Push::StartWorking
        } else {
            Push::Queued
        };
        self.fifo.push(node);
        result
    }

    /// Takes the next item, or detects the end of the burst. Only the
    /// fiber elected by [`Push::StartWorking`] should call this, in a
    /// loop, until [`GetWork::Empty`].
    pub fn get_work(&self) -> GetWork<T> {
        while self
            .working
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            yield_now();
        }

        let result = loop {
            // Safety: the `working` flag serialises consumers.
            if let Some(node) = unsafe { self.fifo.try_pop() } {
                self.out_count.fetch_add(1, Ordering::Relaxed);
                // Safety: node just popped, exclusively owned.
                break GetWork::More(unsafe { node.take() }.expect("work node without item"));
            }

            let out_count = self.out_count.load(Ordering::Relaxed);
            if out_count == self.in_count.load(Ordering::Acquire) {
                // settle the books; producers may still race in
                self.out_count.store(0, Ordering::Relaxed);
                if self.in_count.fetch_sub(out_count, Ordering::AcqRel) - out_count == 0 {
                    break GetWork::Empty;
                }
            }
            // a producer has bumped in_count but hasn't finished pushing
            core::hint::spin_loop();
        };

        self.working.store(false, Ordering::Release);
        result
    }
}

impl<T: Send> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
