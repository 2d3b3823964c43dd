//! Heap-allocated MPMC LIFO stack.
//!
//! A thin allocate-and-dispatch shim around [`IntrusiveStack`], mirroring
//! [`crate::queue`]'s relationship to [`crate::fifo`]: `push` boxes the
//! value into a [`StackEntry`] via the configured allocator, `pop` takes
//! the node back out and frees it.

use core::mem;
use core::ptr::{self, NonNull};

use crate::malloc::{Allocator, GlobalAllocator};
use crate::stack::{IntrusiveStack, StackEntry};

/// A heap-allocated multi-producer, multi-consumer LIFO stack.
pub struct Stack<T, A: Allocator + Default = GlobalAllocator> {
    stack: IntrusiveStack<T>,
    alloc: A,
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Stack<T> {
    /// Create a new, empty stack using the global allocator.
    pub fn new() -> Self {
        Self::with_allocator(GlobalAllocator)
    }
}

impl<T, A: Allocator + Default> Stack<T, A> {
    /// Create a new, empty stack using the given allocator.
    pub fn with_allocator(alloc: A) -> Self {
        Self {
            stack: IntrusiveStack::new(),
            alloc,
        }
    }

    /// Whether the stack is currently empty. Racy under concurrent use.
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Number of entries currently on the stack. Racy under concurrent use;
    /// intended for diagnostics and tests, not synchronization.
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// Push `value` onto the top of the stack. Returns `Err(value)` if the
    /// allocator could not satisfy the request.
    pub fn push(&self, value: T) -> Result<(), T> {
        match self.alloc.malloc(mem::size_of::<StackEntry<T>>()) {
            None => Err(value),
            Some(ptr) => unsafe {
                let entry_ptr = ptr.as_ptr().cast::<StackEntry<T>>();
                entry_ptr.write(StackEntry::new(value));
                self.stack.push(entry_ptr);
                Ok(())
            },
        }
    }

    /// Pop the value at the top of the stack, or `None` if empty.
    pub fn pop(&self) -> Option<T> {
        unsafe {
            let node = self.stack.pop()?;
            let owned = ptr::read(node);
            self.alloc.free(
                NonNull::new_unchecked(node.cast::<u8>()),
                mem::size_of::<StackEntry<T>>(),
                false,
            );
            Some(owned.into_data())
        }
    }

    /// Remove every entry, running each value's destructor and freeing its
    /// node. Unlike the intrusive stack's own `clear`, the owning stack has
    /// no non-destructive form: every node here was heap-allocated by the
    /// stack itself, so leaving them unreachable without freeing would leak.
    pub fn clear(&self) {
        self.drain_and_free();
    }

    fn drain_and_free(&self) {
        unsafe {
            while let Some(node) = self.stack.pop() {
                let owned = ptr::read(node);
                drop(owned);
                self.alloc.free(
                    NonNull::new_unchecked(node.cast::<u8>()),
                    mem::size_of::<StackEntry<T>>(),
                    false,
                );
            }
        }
    }
}

impl<T, A: Allocator + Default> Drop for Stack<T, A> {
    fn drop(&mut self) {
        self.drain_and_free();
    }
}

unsafe impl<T: Send, A: Allocator + Default + Send> Send for Stack<T, A> {}
unsafe impl<T: Send, A: Allocator + Default + Sync> Sync for Stack<T, A> {}
