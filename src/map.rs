//! Heap-allocated ordered map.
//!
//! A thin allocate-and-dispatch shim around [`IntrusiveRbTree`]: every
//! `insert` heap-allocates a node embedding the key, value, and red-black
//! link fields, hands it to the intrusive tree, and every `remove` takes
//! the node back out and frees it. All the algorithmic content lives in
//! [`crate::tree`]; this module only owns storage.
//!
//! Thread-safety is opt-in and coarse: `Map` is generic over an
//! [`Lock`](crate::spinlock::Lock), defaulting to
//! [`NullLock`](crate::spinlock::NullLock) (no synchronization at all, for
//! single-threaded use or externally-serialized access). Pass
//! `FasLock<()>` for a real spinlock shared across threads.

use core::mem;
use core::ptr::{self, NonNull};

use crate::malloc::{Allocator, GlobalAllocator};
use crate::spinlock::{Lock, NullLock};
use crate::tree::{IntrusiveRbTree, RbLink, TreeNode};

struct Node<K, V> {
    link: RbLink<Node<K, V>>,
    key: K,
    value: V,
}

unsafe impl<K: Ord, V> TreeNode for Node<K, V> {
    type Key = K;

    fn key(&self) -> &K {
        &self.key
    }

    fn link(&self) -> &RbLink<Self> {
        &self.link
    }
}

/// Outcome of an [`Map::insert`] attempt.
#[derive(Debug)]
pub enum Insert<K, V> {
    /// The key was new; the map now contains it.
    Inserted,
    /// A node with this key already existed. The map is unchanged and the
    /// rejected key/value are handed back.
    Duplicate(K, V),
    /// The allocator could not satisfy the request. The map is unchanged
    /// and the key/value are handed back.
    AllocFailed(K, V),
}

impl<K, V> Insert<K, V> {
    /// Whether the key was newly inserted.
    pub fn is_inserted(&self) -> bool {
        matches!(self, Insert::Inserted)
    }
}

struct LockGuard<'a, L: Lock>(&'a L);

impl<'a, L: Lock> LockGuard<'a, L> {
    fn acquire(lock: &'a L) -> Self {
        lock.lock();
        Self(lock)
    }
}

impl<L: Lock> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

/// A heap-allocated ordered map, keyed by `K`, built on a red-black tree
/// with the color bit tagged into the parent pointer.
pub struct Map<K, V, L: Lock = NullLock, A: Allocator + Default = GlobalAllocator> {
    tree: IntrusiveRbTree<Node<K, V>>,
    lock: L,
    alloc: A,
}

impl<K: Ord, V, L: Lock, A: Allocator + Default> Default for Map<K, V, L, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V, L: Lock, A: Allocator + Default> Map<K, V, L, A> {
    /// Create a new, empty map using a default-constructed lock and
    /// allocator.
    pub fn new() -> Self {
        Self {
            tree: IntrusiveRbTree::new(),
            lock: L::default(),
            alloc: A::default(),
        }
    }

    /// Create a new, empty map using the given allocator.
    pub fn with_allocator(alloc: A) -> Self {
        Self {
            tree: IntrusiveRbTree::new(),
            lock: L::default(),
            alloc,
        }
    }

    fn acquire(&self) -> LockGuard<'_, L> {
        LockGuard::acquire(&self.lock)
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        let _g = self.acquire();
        self.tree.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        let _g = self.acquire();
        self.tree.is_empty()
    }

    /// Insert `key`/`value`. See [`Insert`] for the possible outcomes.
    pub fn insert(&self, key: K, value: V) -> Insert<K, V> {
        let _g = self.acquire();

        if self.tree.find(&key).is_some() {
            return Insert::Duplicate(key, value);
        }

        match self.alloc.malloc(mem::size_of::<Node<K, V>>()) {
            None => Insert::AllocFailed(key, value),
            Some(ptr) => unsafe {
                let node_ptr = ptr.as_ptr().cast::<Node<K, V>>();
                node_ptr.write(Node {
                    link: RbLink::new(),
                    key,
                    value,
                });
                self.tree
                    .insert(node_ptr)
                    .expect("duplicate already ruled out under the lock");
                Insert::Inserted
            },
        }
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        let _g = self.acquire();
        self.tree.find(key).is_some()
    }

    /// Run `f` against the value stored under `key`, if present.
    ///
    /// Access is closure-scoped rather than reference-returning so the
    /// lock (when `L` is a real one) stays held for the whole read instead
    /// of being releasable while a caller still holds a borrow into freed
    /// memory.
    pub fn get<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        let _g = self.acquire();
        self.tree.find(key).map(|n| unsafe { f(&(*n).value) })
    }

    /// Run `f` mutably against the value stored under `key`, if present.
    pub fn get_mut<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let _g = self.acquire();
        self.tree.find(key).map(|n| unsafe { f(&mut (*n).value) })
    }

    /// Remove and return the value stored under `key`, if present.
    pub fn remove(&self, key: &K) -> Option<V> {
        let _g = self.acquire();
        let node = self.tree.erase(key)?;
        unsafe {
            let owned = ptr::read(node);
            self.alloc.free(
                NonNull::new_unchecked(node.cast::<u8>()),
                mem::size_of::<Node<K, V>>(),
                false,
            );
            Some(owned.value)
        }
    }

    /// Visit every key/value pair in ascending key order.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        let _g = self.acquire();
        unsafe {
            for n in self.tree.iter() {
                f(&(*n).key, &(*n).value);
            }
        }
    }

    /// Verify the underlying tree's red-black invariants. A debugging aid,
    /// not part of the hot path.
    pub fn check_rb(&self) -> bool {
        let _g = self.acquire();
        self.tree.check_rb()
    }

    /// Remove every entry, running each value's destructor and freeing its
    /// node. Unlike the intrusive tree's own `clear`, the owning map has no
    /// non-destructive form: every node here was heap-allocated by the map
    /// itself, so leaving them unreachable without freeing would leak.
    pub fn clear(&self) {
        let _g = self.acquire();
        self.clear_locked();
    }

    /// Walk and free every node. Caller must already hold `self.lock`.
    fn clear_locked(&self) {
        unsafe {
            while let Some(n) = self.tree.first() {
                self.tree.erase_node(n);
                let owned = ptr::read(n);
                drop(owned);
                self.alloc.free(
                    NonNull::new_unchecked(n.cast::<u8>()),
                    mem::size_of::<Node<K, V>>(),
                    false,
                );
            }
        }
    }
}

impl<K: Ord, V, L: Lock, A: Allocator + Default> Drop for Map<K, V, L, A> {
    fn drop(&mut self) {
        self.clear_locked();
    }
}

unsafe impl<K: Send, V: Send, L: Lock + Send, A: Allocator + Default + Send> Send
    for Map<K, V, L, A>
{
}
unsafe impl<K: Send, V: Send, L: Lock + Sync, A: Allocator + Default + Sync> Sync
    for Map<K, V, L, A>
{
}
