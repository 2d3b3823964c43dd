//! Intrusive MPMC FIFO queue.
//!
//! The producer side is lock-free: pushing is one atomic exchange on
//! `tail` plus a release store linking the previous tail to the new
//! entry (or, on the empty-to-nonempty transition, a short CAS retry
//! against a concurrent popper — see [`IntrusiveFifo::push`]). The
//! consumer side carries a single spin-lock bit packed into `head`'s
//! low bit, so at most one consumer is ever splicing the head pointer
//! at a time.
//!
//! Caller owns every [`FifoEntry`]: this module never allocates or
//! frees one. See [`crate::queue`] for a heap-allocating wrapper.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::backoff::AdaptivePause;
use crate::cache::CachePadded;

#[cfg(feature = "queue-verification")]
use core::sync::atomic::AtomicU64;

const LOCK_BIT: usize = 0b1;

#[inline]
fn locked<T>(ptr: *mut FifoEntry<T>) -> *mut FifoEntry<T> {
    (ptr as usize | LOCK_BIT) as *mut FifoEntry<T>
}

#[inline]
fn unlocked<T>(ptr: *mut FifoEntry<T>) -> *mut FifoEntry<T> {
    (ptr as usize & !LOCK_BIT) as *mut FifoEntry<T>
}

#[inline]
fn is_locked<T>(ptr: *mut FifoEntry<T>) -> bool {
    (ptr as usize & LOCK_BIT) != 0
}

/// A node in the intrusive FIFO.
///
/// `#[repr(C)]` with `next` as the first field guarantees the entry is at
/// least pointer-aligned, which is what the head pointer's lock-bit tag
/// needs (bit 0 free).
#[repr(C)]
pub struct FifoEntry<T> {
    next: AtomicPtr<FifoEntry<T>>,
    #[cfg(feature = "queue-verification")]
    pop_sequence: AtomicU64,
    data: T,
}

impl<T> FifoEntry<T> {
    /// Create a new, unlinked entry.
    #[inline]
    pub fn new(data: T) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            #[cfg(feature = "queue-verification")]
            pop_sequence: AtomicU64::new(0),
            data,
        }
    }

    /// Borrow the payload.
    #[inline]
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Mutably borrow the payload.
    #[inline]
    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    /// Consume the entry, returning the payload.
    #[inline]
    pub fn into_data(self) -> T {
        self.data
    }

    /// The global pop order stamped onto this entry, if it has been popped
    /// from an [`IntrusiveFifo`] built with the `queue-verification` feature.
    #[cfg(feature = "queue-verification")]
    #[inline]
    pub fn pop_sequence(&self) -> u64 {
        self.pop_sequence.load(Ordering::Relaxed)
    }
}

/// An intrusive multi-producer, multi-consumer FIFO queue.
///
/// `push` never blocks waiting on another pusher (lock-free). `pop` may
/// have to wait for at most one other popper holding the head's lock bit.
pub struct IntrusiveFifo<T> {
    head: CachePadded<AtomicPtr<FifoEntry<T>>>,
    tail: CachePadded<AtomicPtr<FifoEntry<T>>>,
    size: CachePadded<AtomicUsize>,
    pause: CachePadded<AdaptivePause>,
    #[cfg(feature = "queue-verification")]
    pop_counter: CachePadded<AtomicU64>,
}

impl<T> Default for IntrusiveFifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IntrusiveFifo<T> {
    /// Create a new, empty queue.
    pub const fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            tail: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            size: CachePadded::new(AtomicUsize::new(0)),
            pause: CachePadded::new(AdaptivePause::new()),
            #[cfg(feature = "queue-verification")]
            pop_counter: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Number of entries currently in the queue.
    ///
    /// Tracked eagerly with a relaxed counter; under concurrent access this
    /// is a snapshot, not a transactionally consistent count.
    #[inline]
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Whether the queue is currently empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        unlocked(self.head.load(Ordering::Acquire)).is_null()
    }

    /// Unlink every entry without freeing it. The caller is responsible for
    /// whatever happens to the entries that were reachable.
    ///
    /// # Safety
    ///
    /// No other operation may be concurrently in progress on this queue.
    pub unsafe fn clear(&self) {
        self.head.store(ptr::null_mut(), Ordering::Release);
        self.tail.store(ptr::null_mut(), Ordering::Release);
        self.size.store(0, Ordering::Relaxed);
    }

    /// Push `entry` onto the tail of the queue.
    ///
    /// # Safety
    ///
    /// `entry` must point to a live, otherwise-unreachable [`FifoEntry`]
    /// (not already linked into this or any other container), and must
    /// remain valid until it is popped back out.
    pub unsafe fn push(&self, entry: *mut FifoEntry<T>) {
        debug_assert!(!entry.is_null());
        debug_assert_eq!(entry as usize & LOCK_BIT, 0, "entry must be at least 2-byte aligned");

        (*entry).next.store(ptr::null_mut(), Ordering::Relaxed);
        let prev = self.tail.swap(entry, Ordering::AcqRel);

        if prev.is_null() {
            // Empty-to-nonempty transition. A concurrent popper may be
            // mid-pop against the stale empty head (locked, node == null);
            // retry the install until it has released the lock.
            loop {
                match self.head.compare_exchange_weak(
                    ptr::null_mut(),
                    entry,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(_) => crate::pr::stall(),
                }
            }
        } else {
            (*prev).next.store(entry, Ordering::Release);
        }

        self.size.fetch_add(1, Ordering::Relaxed);
    }

    /// Pop the entry at the head of the queue.
    ///
    /// Returns `None` if the queue is empty.
    pub unsafe fn pop(&self) -> Option<*mut FifoEntry<T>> {
        // Null fast path: an empty, unlocked head is exactly the null
        // pointer (the lock bit tags even a "locked and empty" head to a
        // nonzero value), so a relaxed peek can rule out the common case
        // without ever touching the lock bit.
        if self.head.load(Ordering::Relaxed).is_null() {
            return None;
        }

        let node = self.lock_head();

        if node.is_null() {
            self.head.store(ptr::null_mut(), Ordering::Release);
            return None;
        }

        let next = (*node).next.load(Ordering::Acquire);
        if !next.is_null() {
            self.head.store(next, Ordering::Release);
        } else {
            // Either `node` really is the last entry, or a producer has
            // claimed `tail` via exchange but hasn't linked `node.next`
            // yet. Try to close the queue out at `tail`; if that fails,
            // a push is in flight and will finish linking shortly.
            match self.tail.compare_exchange(
                node,
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => self.head.store(ptr::null_mut(), Ordering::Release),
                Err(_) => {
                    let mut next = (*node).next.load(Ordering::Acquire);
                    while next.is_null() {
                        crate::pr::stall();
                        next = (*node).next.load(Ordering::Acquire);
                    }
                    self.head.store(next, Ordering::Release);
                }
            }
        }

        self.size.fetch_sub(1, Ordering::Relaxed);

        #[cfg(feature = "queue-verification")]
        {
            let seq = self.pop_counter.fetch_add(1, Ordering::Relaxed);
            (*node).pop_sequence.store(seq, Ordering::Relaxed);
        }

        Some(node)
    }

    /// Acquire the head lock bit and return the (untagged) node pointer the
    /// lock was protecting. Caller must eventually restore `head` to an
    /// unlocked value (either the new head, or null).
    unsafe fn lock_head(&self) -> *mut FifoEntry<T> {
        let mut observed = self.head.load(Ordering::Relaxed);
        loop {
            if !is_locked(observed) {
                match self.head.compare_exchange_weak(
                    observed,
                    locked(observed),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return unlocked(observed),
                    Err(actual) => observed = actual,
                }
                continue;
            }

            let prior_estimate = self.pause.estimate();
            match self.pause.spin_until(|| {
                observed = self.head.load(Ordering::Relaxed);
                !is_locked(observed)
            }) {
                Some(spent) => self.pause.record(prior_estimate, spent.max(1)),
                None => {
                    self.pause
                        .record(prior_estimate, prior_estimate.saturating_mul(2).max(1));
                    observed = self.head.load(Ordering::Relaxed);
                }
            }
        }
    }
}

unsafe impl<T: Send> Send for IntrusiveFifo<T> {}
unsafe impl<T: Send> Sync for IntrusiveFifo<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    unsafe fn leak(value: i32) -> *mut FifoEntry<i32> {
        Box::into_raw(Box::new(FifoEntry::new(value)))
    }

    unsafe fn reclaim(entry: *mut FifoEntry<i32>) {
        drop(Box::from_raw(entry));
    }

    #[test]
    fn test_new_queue_is_empty() {
        let fifo: IntrusiveFifo<i32> = IntrusiveFifo::new();
        assert!(fifo.is_empty());
        assert_eq!(fifo.len(), 0);
    }

    #[test]
    fn test_push_pop_single() {
        let fifo: IntrusiveFifo<i32> = IntrusiveFifo::new();
        unsafe {
            let e = leak(42);
            fifo.push(e);
            assert!(!fifo.is_empty());
            assert_eq!(fifo.len(), 1);

            let popped = fifo.pop().unwrap();
            assert_eq!(*(*popped).data(), 42);
            assert!(fifo.is_empty());
            assert_eq!(fifo.len(), 0);
            reclaim(popped);
        }
    }

    #[test]
    fn test_fifo_order_preserved() {
        let fifo: IntrusiveFifo<i32> = IntrusiveFifo::new();
        unsafe {
            let entries: alloc::vec::Vec<_> = (0..10).map(leak).collect();
            for &e in &entries {
                fifo.push(e);
            }
            assert_eq!(fifo.len(), 10);

            for expected in 0..10 {
                let popped = fifo.pop().unwrap();
                assert_eq!(*(*popped).data(), expected);
                reclaim(popped);
            }
            assert!(fifo.pop().is_none());
        }
    }

    #[test]
    fn test_pop_empty_returns_none() {
        let fifo: IntrusiveFifo<i32> = IntrusiveFifo::new();
        unsafe {
            assert!(fifo.pop().is_none());
            assert!(fifo.pop().is_none());
        }
    }

    #[test]
    fn test_clear_does_not_free_entries() {
        let fifo: IntrusiveFifo<i32> = IntrusiveFifo::new();
        unsafe {
            let a = leak(1);
            let b = leak(2);
            fifo.push(a);
            fifo.push(b);

            fifo.clear();
            assert!(fifo.is_empty());
            assert_eq!(fifo.len(), 0);

            // The entries themselves are still valid; caller owns them.
            assert_eq!(*(*a).data(), 1);
            assert_eq!(*(*b).data(), 2);
            reclaim(a);
            reclaim(b);
        }
    }

    #[test]
    fn test_interleaved_push_pop() {
        let fifo: IntrusiveFifo<i32> = IntrusiveFifo::new();
        unsafe {
            let e1 = leak(1);
            let e2 = leak(2);
            fifo.push(e1);
            let p1 = fifo.pop().unwrap();
            assert_eq!(*(*p1).data(), 1);
            reclaim(p1);

            fifo.push(e2);
            let e3 = leak(3);
            fifo.push(e3);
            let p2 = fifo.pop().unwrap();
            assert_eq!(*(*p2).data(), 2);
            reclaim(p2);
            let p3 = fifo.pop().unwrap();
            assert_eq!(*(*p3).data(), 3);
            reclaim(p3);
            assert!(fifo.is_empty());
        }
    }

    #[test]
    fn test_concurrent_producers_single_consumer() {
        use std::sync::Arc;
        use std::thread;

        let fifo: Arc<IntrusiveFifo<i32>> = Arc::new(IntrusiveFifo::new());
        const PRODUCERS: i32 = 4;
        const PER_PRODUCER: i32 = 2_000;

        let mut handles = alloc::vec::Vec::new();
        for p in 0..PRODUCERS {
            let fifo = Arc::clone(&fifo);
            handles.push(thread::spawn(move || unsafe {
                for i in 0..PER_PRODUCER {
                    let entry = leak(p * PER_PRODUCER + i);
                    fifo.push(entry);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut count = 0;
        unsafe {
            while let Some(popped) = fifo.pop() {
                count += 1;
                reclaim(popped);
            }
        }
        assert_eq!(count, PRODUCERS * PER_PRODUCER);
        assert!(fifo.is_empty());
        assert_eq!(fifo.len(), 0);
    }

    #[test]
    fn test_seed_scenario_single_thread_one_million() {
        let fifo: IntrusiveFifo<i32> = IntrusiveFifo::new();
        const N: i32 = 1_000_000;
        unsafe {
            for i in 1..=N {
                fifo.push(leak(i));
            }
            assert_eq!(fifo.len(), N as usize);

            for expected in 1..=N {
                let popped = fifo.pop().expect("queue must not be empty yet");
                assert_eq!(*(*popped).data(), expected);
                reclaim(popped);
            }
            assert!(fifo.pop().is_none());
        }
    }

    #[cfg(feature = "queue-verification")]
    #[test]
    fn test_seed_scenario_per_producer_order_eight_threads() {
        use std::sync::Arc;
        use std::thread;

        let fifo: Arc<IntrusiveFifo<i32>> = Arc::new(IntrusiveFifo::new());
        const PRODUCERS: i32 = 8;
        const PER_PRODUCER: i32 = 625_000;

        let mut handles = alloc::vec::Vec::new();
        for p in 0..PRODUCERS {
            let fifo = Arc::clone(&fifo);
            handles.push(thread::spawn(move || unsafe {
                for i in 0..PER_PRODUCER {
                    fifo.push(leak(p * PER_PRODUCER + i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // Drain with a single consumer, recording each value's pop-sequence
        // stamp alongside it so we can reconstruct the total pop order
        // afterwards without the collection order itself being load-bearing.
        let mut popped = alloc::vec::Vec::with_capacity((PRODUCERS * PER_PRODUCER) as usize);
        unsafe {
            while let Some(node) = fifo.pop() {
                popped.push(((*node).pop_sequence(), *(*node).data()));
                reclaim(node);
            }
        }
        popped.sort_by_key(|&(seq, _)| seq);
        let values: alloc::vec::Vec<i32> = popped.iter().map(|&(_, v)| v).collect();

        assert_eq!(values.len(), (PRODUCERS * PER_PRODUCER) as usize);

        let mut union: alloc::vec::Vec<i32> = values.clone();
        union.sort_unstable();
        assert_eq!(union, (0..PRODUCERS * PER_PRODUCER).collect::<alloc::vec::Vec<_>>());

        for p in 0..PRODUCERS {
            let partition: alloc::vec::Vec<i32> = values
                .iter()
                .copied()
                .filter(|&v| v / PER_PRODUCER == p)
                .collect();
            let expected: alloc::vec::Vec<i32> =
                (p * PER_PRODUCER..(p + 1) * PER_PRODUCER).collect();
            assert_eq!(partition, expected, "producer {p}'s push order must survive");
        }
    }
}
