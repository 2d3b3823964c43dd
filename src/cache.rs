//! Cache-line padding.
//!
//! The MPMC queue and stack each have one field the producer side touches
//! (`tail`) and one the consumer side touches (`head`), plus shared
//! bookkeeping (`size`, the pause estimate). Packed into one cache line,
//! every producer push would invalidate the consumer's line and vice versa.
//! [`CachePadded`] pads each field out to its own line so the two sides
//! stop fighting over cache coherency traffic.

use core::ops::{Deref, DerefMut};

/// Most x86-64 and AArch64 parts use 64-byte cache lines; this is the same
/// constant the original queue/stack protocol aligns its hot fields to.
const CACHELINE_SIZE: usize = 64;

/// Wraps `T`, padding it out to a full cache line.
#[repr(align(64))]
pub struct CachePadded<T>(T);

impl<T> CachePadded<T> {
    /// Wrap `value`, padding it to a cache line boundary.
    #[inline]
    pub const fn new(value: T) -> Self {
        Self(value)
    }

    /// Unwrap, discarding the padding.
    #[inline]
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: Default> Default for CachePadded<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CachePadded<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}
