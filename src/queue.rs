//! Heap-allocated MPMC FIFO queue.
//!
//! A thin allocate-and-dispatch shim around [`IntrusiveFifo`]: `push` boxes
//! the value into a [`FifoEntry`] via the configured allocator and hands it
//! to the intrusive queue; `pop` takes the node back out, copies the value
//! off the heap, and frees it. All the lock-free/bit-locked machinery lives
//! in [`crate::fifo`]; this module only owns storage.

use core::mem;
use core::ptr::{self, NonNull};

use crate::fifo::{FifoEntry, IntrusiveFifo};
use crate::malloc::{Allocator, GlobalAllocator};

/// A heap-allocated multi-producer, multi-consumer FIFO queue.
pub struct Queue<T, A: Allocator + Default = GlobalAllocator> {
    fifo: IntrusiveFifo<T>,
    alloc: A,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    /// Create a new, empty queue using the global allocator.
    pub fn new() -> Self {
        Self::with_allocator(GlobalAllocator)
    }
}

impl<T, A: Allocator + Default> Queue<T, A> {
    /// Create a new, empty queue using the given allocator.
    pub fn with_allocator(alloc: A) -> Self {
        Self {
            fifo: IntrusiveFifo::new(),
            alloc,
        }
    }

    /// Number of entries currently enqueued. Racy under concurrent use;
    /// intended for diagnostics and tests, not synchronization.
    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    /// Whether the queue is currently empty. Racy under concurrent use.
    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }

    /// Enqueue `value`. Returns `Err(value)` if the allocator could not
    /// satisfy the request.
    pub fn push(&self, value: T) -> Result<(), T> {
        match self.alloc.malloc(mem::size_of::<FifoEntry<T>>()) {
            None => Err(value),
            Some(ptr) => unsafe {
                let entry_ptr = ptr.as_ptr().cast::<FifoEntry<T>>();
                entry_ptr.write(FifoEntry::new(value));
                self.fifo.push(entry_ptr);
                Ok(())
            },
        }
    }

    /// Dequeue the oldest value, or `None` if the queue is empty.
    pub fn pop(&self) -> Option<T> {
        unsafe {
            let node = self.fifo.pop()?;
            let owned = ptr::read(node);
            self.alloc.free(
                NonNull::new_unchecked(node.cast::<u8>()),
                mem::size_of::<FifoEntry<T>>(),
                false,
            );
            Some(owned.into_data())
        }
    }

    /// Remove every entry, running each value's destructor and freeing its
    /// node. Unlike the intrusive queue's own `clear`, the owning queue has
    /// no non-destructive form: every node here was heap-allocated by the
    /// queue itself, so leaving them unreachable without freeing would leak.
    pub fn clear(&self) {
        self.drain_and_free();
    }

    fn drain_and_free(&self) {
        unsafe {
            while let Some(node) = self.fifo.pop() {
                let owned = ptr::read(node);
                drop(owned);
                self.alloc.free(
                    NonNull::new_unchecked(node.cast::<u8>()),
                    mem::size_of::<FifoEntry<T>>(),
                    false,
                );
            }
        }
    }
}

impl<T, A: Allocator + Default> Drop for Queue<T, A> {
    fn drop(&mut self) {
        self.drain_and_free();
    }
}

unsafe impl<T: Send, A: Allocator + Default + Send> Send for Queue<T, A> {}
unsafe impl<T: Send, A: Allocator + Default + Sync> Sync for Queue<T, A> {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_new_queue_is_empty() {
        let q: Queue<i32> = Queue::new();
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_push_pop_single() {
        let q: Queue<i32> = Queue::new();
        q.push(7).unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop(), Some(7));
        assert!(q.is_empty());
    }

    #[test]
    fn test_fifo_order_preserved() {
        let q: Queue<i32> = Queue::new();
        for i in 0..10 {
            q.push(i).unwrap();
        }
        for i in 0..10 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_pop_empty_returns_none() {
        let q: Queue<i32> = Queue::new();
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_drop_frees_remaining_entries() {
        let q: Queue<alloc::string::String> = Queue::new();
        for i in 0..20 {
            q.push(alloc::format!("item-{i}")).unwrap();
        }
        drop(q);
    }

    #[test]
    fn test_clear_empties_queue_and_remains_usable() {
        let q: Queue<alloc::string::String> = Queue::new();
        for i in 0..20 {
            q.push(alloc::format!("item-{i}")).unwrap();
        }
        assert_eq!(q.len(), 20);

        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
        assert_eq!(q.pop(), None);

        q.push(alloc::string::String::from("after-clear")).unwrap();
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_concurrent_producers_single_consumer() {
        use std::sync::Arc;
        use std::thread;

        let q: Arc<Queue<i32>> = Arc::new(Queue::new());
        const PRODUCERS: i32 = 4;
        const PER_PRODUCER: i32 = 2_000;

        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    q.push(p * PER_PRODUCER + i).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut count = 0;
        while q.pop().is_some() {
            count += 1;
        }
        assert_eq!(count, PRODUCERS * PER_PRODUCER);
    }
}
