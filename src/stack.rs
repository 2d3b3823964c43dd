//! Intrusive MPMC LIFO stack.
//!
//! Uses the same head-bit-lock technique as [`crate::fifo`], but applies it
//! to both push and pop: the stack has only one hot pointer (`head`), so
//! there's no lock-free producer side to preserve the way the queue has —
//! every mutator takes the lock bit, splices, and releases.
//!
//! Caller owns every [`StackEntry`]: this module never allocates or frees
//! one. See [`crate::stack_owned`] for a heap-allocating wrapper.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::backoff::AdaptivePause;
use crate::cache::CachePadded;

const LOCK_BIT: usize = 0b1;

#[inline]
fn locked<T>(ptr: *mut StackEntry<T>) -> *mut StackEntry<T> {
    (ptr as usize | LOCK_BIT) as *mut StackEntry<T>
}

#[inline]
fn unlocked<T>(ptr: *mut StackEntry<T>) -> *mut StackEntry<T> {
    (ptr as usize & !LOCK_BIT) as *mut StackEntry<T>
}

#[inline]
fn is_locked<T>(ptr: *mut StackEntry<T>) -> bool {
    (ptr as usize & LOCK_BIT) != 0
}

/// A node in the intrusive stack.
#[repr(C)]
pub struct StackEntry<T> {
    next: AtomicPtr<StackEntry<T>>,
    data: T,
}

impl<T> StackEntry<T> {
    /// Create a new, unlinked entry.
    #[inline]
    pub fn new(data: T) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
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
}

/// An intrusive multi-producer, multi-consumer LIFO stack.
///
/// Both `push` and `pop` briefly hold the head lock bit; under heavy
/// contention the [`AdaptivePause`] estimate keeps the spin proportional
/// to how long the lock has recently been held.
pub struct IntrusiveStack<T> {
    head: CachePadded<AtomicPtr<StackEntry<T>>>,
    size: CachePadded<AtomicUsize>,
    pause: CachePadded<AdaptivePause>,
}

impl<T> Default for IntrusiveStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IntrusiveStack<T> {
    /// Create a new, empty stack.
    pub const fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            size: CachePadded::new(AtomicUsize::new(0)),
            pause: CachePadded::new(AdaptivePause::new()),
        }
    }

    /// Whether the stack is currently empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        unlocked(self.head.load(Ordering::Acquire)).is_null()
    }

    /// Number of entries currently on the stack.
    ///
    /// Tracked eagerly with a relaxed counter, mirroring
    /// [`crate::fifo::IntrusiveFifo::len`]; under concurrent access this is
    /// a snapshot, not a transactionally consistent count.
    #[inline]
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Push `entry` onto the top of the stack.
    ///
    /// # Safety
    ///
    /// `entry` must point to a live, otherwise-unreachable [`StackEntry`]
    /// (not already linked into this or any other container), and must
    /// remain valid until it is popped back out.
    pub unsafe fn push(&self, entry: *mut StackEntry<T>) {
        debug_assert!(!entry.is_null());
        debug_assert_eq!(entry as usize & LOCK_BIT, 0, "entry must be at least 2-byte aligned");

        let top = self.lock_head();
        (*entry).next.store(top, Ordering::Relaxed);
        self.head.store(entry, Ordering::Release);
        self.size.fetch_add(1, Ordering::Relaxed);
    }

    /// Pop the entry at the top of the stack.
    ///
    /// Returns `None` if the stack is empty.
    pub unsafe fn pop(&self) -> Option<*mut StackEntry<T>> {
        let top = self.lock_head();

        if top.is_null() {
            self.head.store(ptr::null_mut(), Ordering::Release);
            return None;
        }

        let next = (*top).next.load(Ordering::Relaxed);
        self.head.store(next, Ordering::Release);
        (*top).next.store(ptr::null_mut(), Ordering::Relaxed);
        self.size.fetch_sub(1, Ordering::Relaxed);

        Some(top)
    }

    /// Unlink every entry without freeing it. The caller is responsible for
    /// whatever happens to the entries that were reachable.
    ///
    /// # Safety
    ///
    /// No other operation may be concurrently in progress on this stack.
    pub unsafe fn clear(&self) {
        self.head.store(ptr::null_mut(), Ordering::Release);
        self.size.store(0, Ordering::Relaxed);
    }

    /// Acquire the head lock bit and return the (untagged) node pointer it
    /// was protecting. Caller must eventually restore `head` to an
    /// unlocked value.
    unsafe fn lock_head(&self) -> *mut StackEntry<T> {
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

unsafe impl<T: Send> Send for IntrusiveStack<T> {}
unsafe impl<T: Send> Sync for IntrusiveStack<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    unsafe fn leak(value: i32) -> *mut StackEntry<i32> {
        Box::into_raw(Box::new(StackEntry::new(value)))
    }

    unsafe fn reclaim(entry: *mut StackEntry<i32>) {
        drop(Box::from_raw(entry));
    }

    #[test]
    fn test_new_stack_is_empty() {
        let stack: IntrusiveStack<i32> = IntrusiveStack::new();
        assert!(stack.is_empty());
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn test_len_tracks_push_and_pop() {
        let stack: IntrusiveStack<i32> = IntrusiveStack::new();
        unsafe {
            let entries: alloc::vec::Vec<_> = (0..5).map(leak).collect();
            for (i, &e) in entries.iter().enumerate() {
                stack.push(e);
                assert_eq!(stack.len(), i + 1);
            }
            for i in (0..5).rev() {
                let popped = stack.pop().unwrap();
                reclaim(popped);
                assert_eq!(stack.len(), i);
            }
        }
    }

    #[test]
    fn test_clear_does_not_free_entries() {
        let stack: IntrusiveStack<i32> = IntrusiveStack::new();
        unsafe {
            let a = leak(1);
            let b = leak(2);
            stack.push(a);
            stack.push(b);

            stack.clear();
            assert!(stack.is_empty());
            assert_eq!(stack.len(), 0);

            // The entries themselves are still valid; caller owns them.
            assert_eq!(*(*a).data(), 1);
            assert_eq!(*(*b).data(), 2);
            reclaim(a);
            reclaim(b);
        }
    }

    #[test]
    fn test_push_pop_single() {
        let stack: IntrusiveStack<i32> = IntrusiveStack::new();
        unsafe {
            let e = leak(42);
            stack.push(e);
            assert!(!stack.is_empty());

            let popped = stack.pop().unwrap();
            assert_eq!(*(*popped).data(), 42);
            assert!(stack.is_empty());
            reclaim(popped);
        }
    }

    #[test]
    fn test_lifo_order_preserved() {
        let stack: IntrusiveStack<i32> = IntrusiveStack::new();
        unsafe {
            let entries: alloc::vec::Vec<_> = (0..5).map(leak).collect();
            for &e in &entries {
                stack.push(e);
            }

            for expected in (0..5).rev() {
                let popped = stack.pop().unwrap();
                assert_eq!(*(*popped).data(), expected);
                reclaim(popped);
            }
            assert!(stack.pop().is_none());
        }
    }

    #[test]
    fn test_pop_empty_returns_none() {
        let stack: IntrusiveStack<i32> = IntrusiveStack::new();
        unsafe {
            assert!(stack.pop().is_none());
            assert!(stack.pop().is_none());
        }
    }

    #[test]
    fn test_popped_entry_next_is_cleared() {
        let stack: IntrusiveStack<i32> = IntrusiveStack::new();
        unsafe {
            let e1 = leak(1);
            let e2 = leak(2);
            stack.push(e1);
            stack.push(e2);

            let popped = stack.pop().unwrap();
            assert!((*popped).next.load(Ordering::Relaxed).is_null());
            reclaim(popped);

            let popped = stack.pop().unwrap();
            reclaim(popped);
        }
    }

    #[test]
    fn test_concurrent_push_pop_conserves_count() {
        use std::sync::Arc;
        use std::thread;

        let stack: Arc<IntrusiveStack<i32>> = Arc::new(IntrusiveStack::new());
        const PUSHERS: i32 = 4;
        const PER_PUSHER: i32 = 2_000;

        let mut handles = alloc::vec::Vec::new();
        for p in 0..PUSHERS {
            let stack = Arc::clone(&stack);
            handles.push(thread::spawn(move || unsafe {
                for i in 0..PER_PUSHER {
                    let entry = leak(p * PER_PUSHER + i);
                    stack.push(entry);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut count = 0;
        unsafe {
            while let Some(popped) = stack.pop() {
                count += 1;
                reclaim(popped);
            }
        }
        assert_eq!(count, PUSHERS * PER_PUSHER);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_seed_scenario_single_thread_lifo() {
        let stack: IntrusiveStack<i32> = IntrusiveStack::new();
        unsafe {
            for i in 1..=100 {
                stack.push(leak(i));
            }
            for expected in (1..=100).rev() {
                let popped = stack.pop().expect("stack must not be empty yet");
                assert_eq!(*(*popped).data(), expected);
                reclaim(popped);
            }
            assert!(stack.pop().is_none());
        }
    }
}
