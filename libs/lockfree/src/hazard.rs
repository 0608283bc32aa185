//! Hazard-pointer reclamation.
//!
//! Based on "Hazard Pointers: Safe Memory Reclamation for Lock-Free
//! Objects" by Maged M. Michael. Each participating thread owns a
//! [`HazardRecord`] with `K` hazard slots and a private retired list; all
//! records of a [`HazardDomain`] are fused into a lock-free singly linked
//! list so any thread's scan can observe every slot.
//!
//! With `N` threads and `K` slots each, the retire threshold `R` is kept at
//! `2·N·K` (and bumped on every record that joins), so a scan frees at
//! least half of the retired list and runs in `O(N·K + R·log(N·K))`.
//!
//! Records themselves are only reclaimed at shutdown
//! ([`HazardDomain::destroy_all`]); tearing a record out mid-flight would
//! race concurrent scans.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::Cell;
use core::ptr::{self, NonNull};

/// Reclamation hook invoked when a retired node is proven unreferenced.
pub type GcFunction = unsafe fn(gc_data: *mut (), node: NonNull<HazardNode>);

/// The part of a lock-free node that the reclamation machinery owns.
///
/// Embed this as the *first* field of a `#[repr(C)]` node so the node
/// pointer and the hazard pointer coincide.
#[repr(C)]
pub struct HazardNode {
    /// Retired-list link. Touched only by the retiring thread.
    next: Cell<*mut HazardNode>,
    gc_data: *mut (),
    gc_function: GcFunction,
}

impl HazardNode {
    pub fn new(gc_function: GcFunction, gc_data: *mut ()) -> Self {
        Self {
            next: Cell::new(ptr::null_mut()),
            gc_data,
            gc_function,
        }
    }

}

// Safety: the retired-list link is single-owner by protocol; the gc hook is
// a plain fn pointer plus an opaque pointer the hook's author vouches for.
unsafe impl Send for HazardNode {}
unsafe impl Sync for HazardNode {}

/// The shared anchor of all [`HazardRecord`]s of one reclamation domain.
pub struct HazardDomain {
    head: AtomicPtr<HazardRecord>,
}

/// Per-thread hazard state: `K` published slots, the retired list and the
/// scratch array reused by [`HazardRecord::scan`].
pub struct HazardRecord {
    next: *mut HazardRecord,
    domain: *const HazardDomain,
    retire_threshold: AtomicUsize,
    retired_count: Cell<usize>,
    retired_list: Cell<*mut HazardNode>,
    /// Scratch for `scan`, kept here to avoid allocating on every pass.
    plist: UnsafeCell<Vec<usize>>,
    slots: Box<[AtomicPtr<HazardNode>]>,
}

// === impl HazardDomain ===

impl HazardDomain {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Creates a new record with `slots_per_thread` hazard slots and fuses
    /// it into the domain.
    ///
    /// The record is leaked until [`HazardDomain::destroy_all`]; every
    /// record already in the domain gets its retire threshold raised by
    /// `2·K` (N grew by one, R = 2·N·K).
    pub fn acquire_record(&self, slots_per_thread: usize) -> NonNull<HazardRecord> {
        assert!(slots_per_thread > 0);

        let record = Box::into_raw(Box::new(HazardRecord {
            next: ptr::null_mut(),
            domain: self,
            retire_threshold: AtomicUsize::new(0),
            retired_count: Cell::new(0),
            retired_list: Cell::new(ptr::null_mut()),
            plist: UnsafeCell::new(Vec::new()),
            slots: (0..slots_per_thread)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
        }));

        // Swap the new record in as the head. The head must always carry
        // the correct threshold, so it is recomputed on every attempt.
        let mut cur_head = self.head.load(Ordering::Acquire);
        loop {
            // Safety: `record` is not yet shared.
            unsafe {
                (*record).next = cur_head;

                let mut threads = 1_usize;
                let mut cur = cur_head;
                while !cur.is_null() {
                    threads += 1;
                    debug_assert_eq!((&(*cur).slots).len(), slots_per_thread);
                    cur = (*cur).next;
                }
                (*record)
                    .retire_threshold
                    .store(2 * threads * slots_per_thread, Ordering::Relaxed);
            }

            match self.head.compare_exchange(
                cur_head,
                record,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(head) => cur_head = head,
            }
        }

        // N grew by one, so every pre-existing record's R grows by 2·K.
        // Safety: records are never freed while the domain is live.
        unsafe {
            let mut cur = (*record).next;
            while !cur.is_null() {
                (*cur)
                    .retire_threshold
                    .fetch_add(2 * slots_per_thread, Ordering::AcqRel);
                cur = (*cur).next;
            }
        }

        // Safety: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(record) }
    }

    /// Reclaims every record and everything still on the retired lists.
    ///
    /// # Safety
    ///
    /// Shutdown only: no thread may hold a hazard slot, publish new
    /// hazards, or retire nodes concurrently.
    pub unsafe fn destroy_all(&self) {
        let mut cur = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        // Safety: exclusive access per the contract.
        unsafe {
            // No slot is live any more, so clearing them lets the final
            // scans free the full retired lists.
            let mut it = cur;
            while !it.is_null() {
                for slot in &(*it).slots {
                    slot.store(ptr::null_mut(), Ordering::Relaxed);
                }
                it = (*it).next;
            }

            while !cur.is_null() {
                let record = Box::from_raw(cur);
                record.scan();
                cur = record.next;
            }
        }
    }
}

impl Default for HazardDomain {
    fn default() -> Self {
        Self::new()
    }
}

// === impl HazardRecord ===

impl HazardRecord {
    /// Publishes "slot `n` is traversing `node`". The caller must re-check
    /// that the source pointer has not moved after publishing.
    #[inline]
    pub fn using(&self, node: NonNull<HazardNode>, n: usize) {
        // SeqCst store: other processors must observe the slot before this
        // thread's subsequent re-read of the source pointer.
        self.slots[n].store(node.as_ptr(), Ordering::SeqCst);
    }

    #[inline]
    pub fn done_using(&self, n: usize) {
        self.slots[n].store(ptr::null_mut(), Ordering::Release);
    }

    /// Retires a node: it will be handed to its gc hook once no hazard
    /// slot in the domain holds it. Triggers a [`HazardRecord::scan`] when
    /// the retired count reaches the threshold.
    pub fn retire(&self, node: NonNull<HazardNode>) {
        // Only this record's owner thread touches the retired list.
        unsafe { node.as_ref() }.next.set(self.retired_list.get());
        self.retired_list.set(node.as_ptr());
        self.retired_count.set(self.retired_count.get() + 1);
        if self.retired_count.get() >= self.retire_threshold.load(Ordering::Acquire) {
            self.scan();
        }
    }

    /// Collects every published hazard in the domain, then frees all
    /// retired nodes not among them; survivors go back on the retired list.
    pub fn scan(&self) {
        // Safety: record pointers stay valid for the domain's lifetime.
        let head = unsafe { (*self.domain).head.load(Ordering::Acquire) };

        self.plist.with_mut(|plist| {
            // Safety: `plist` is only touched by the record's owner.
            let plist = unsafe { &mut *plist };
            plist.clear();

            let mut cur = head;
            while !cur.is_null() {
                // Safety: records are never freed while scanning.
                let record = unsafe { &*cur };
                for slot in &record.slots {
                    let hazard = slot.load(Ordering::Acquire);
                    if !hazard.is_null() {
                        plist.push(hazard as usize);
                    }
                }
                cur = record.next;
            }

            plist.sort_unstable();

            let mut node = self.retired_list.replace(ptr::null_mut());
            self.retired_count.set(0);

            while !node.is_null() {
                // Safety: retired nodes are owned by this record until
                // freed or re-retired below.
                let current = unsafe { &*node };
                let next = current.next.get();

                if plist.binary_search(&(node as usize)).is_ok() {
                    // still in use somewhere, keep it retired
                    current.next.set(self.retired_list.get());
                    self.retired_list.set(node);
                    self.retired_count.set(self.retired_count.get() + 1);
                } else {
                    // Safety: no hazard slot holds this node; the gc hook
                    // owns it from here.
                    unsafe {
                        (current.gc_function)(current.gc_data, NonNull::new_unchecked(node));
                    }
                }
                node = next;
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn retired_len(&self) -> usize {
        self.retired_count.get()
    }
}

// Safety: `slots` and `retire_threshold` are atomics; the remaining fields
// are only touched by the record's owner thread (retire/scan discipline).
unsafe impl Send for HazardRecord {}
unsafe impl Sync for HazardRecord {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RingBuffer;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};

    static FREED: StdAtomicUsize = StdAtomicUsize::new(0);

    unsafe fn count_and_free(_data: *mut (), node: NonNull<HazardNode>) {
        FREED.fetch_add(1, StdOrdering::SeqCst);
        drop(unsafe { Box::from_raw(node.as_ptr()) });
    }

    #[test]
    fn retired_nodes_outlive_published_hazards() {
        let domain = HazardDomain::new();
        let record = domain.acquire_record(2);
        // Safety: single-threaded test, the record is live.
        let record = unsafe { record.as_ref() };

        let node = NonNull::from(Box::leak(Box::new(HazardNode::new(
            count_and_free,
            ptr::null_mut(),
        ))));

        FREED.store(0, StdOrdering::SeqCst);
        record.using(node, 0);
        record.retire(node);
        record.scan();
        // the hazard slot still protects it
        assert_eq!(FREED.load(StdOrdering::SeqCst), 0);
        assert_eq!(record.retired_len(), 1);

        record.done_using(0);
        record.scan();
        assert_eq!(FREED.load(StdOrdering::SeqCst), 1);
        assert_eq!(record.retired_len(), 0);

        // Safety: no hazards remain.
        unsafe { domain.destroy_all() };
    }

    #[test]
    fn stress_every_node_reclaimed_exactly_once() {
        const THREADS: usize = 4;
        const SLOTS: usize = 4;
        const ITERS: usize = 2_000;

        struct Ctx {
            domain: HazardDomain,
            pool: RingBuffer<HazardNode>,
        }

        unsafe fn return_to_pool(data: *mut (), node: NonNull<HazardNode>) {
            // Safety: `data` is the Ctx this node belongs to.
            let ctx = unsafe { &*(data as *const Ctx) };
            if ctx.pool.try_push(node).is_err() {
                drop(unsafe { Box::from_raw(node.as_ptr()) });
            }
        }

        let ctx = Arc::new(Ctx {
            domain: HazardDomain::new(),
            pool: RingBuffer::new(10),
        });

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                std::thread::spawn(move || {
                    let record = ctx.domain.acquire_record(SLOTS);
                    // Safety: records live until destroy_all.
                    let record = unsafe { record.as_ref() };
                    for i in 0..ITERS {
                        let node = ctx.pool.try_pop().unwrap_or_else(|| {
                            NonNull::from(Box::leak(Box::new(HazardNode::new(
                                return_to_pool,
                                Arc::as_ptr(&ctx) as *mut (),
                            ))))
                        });
                        record.using(node, i % SLOTS);
                        record.done_using(i % SLOTS);
                        record.retire(node);
                    }
                    record.scan();
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        // Safety: all worker threads are done.
        unsafe { ctx.domain.destroy_all() };
        // drain whatever went back to the pool
        while let Some(node) = ctx.pool.try_pop() {
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }
    }
}
