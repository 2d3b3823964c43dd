//! Exponential backoff for contention management.
//!
//! This module provides exponential backoff utilities for reducing contention
//! in spin loops. When multiple threads are competing for a resource, backing
//! off exponentially reduces wasted CPU cycles and improves overall throughput.
//!
//! # Example
//!
//! ```
//! use taglock::backoff::Backoff;
//!
//! let mut backoff = Backoff::new();
//!
//! loop {
//!     if try_acquire_lock() {
//!         break;
//!     }
//!     backoff.spin();
//! }
//! # fn try_acquire_lock() -> bool { true }
//! ```
//!
//! [`AdaptivePause`] is a different idiom for the same problem: rather than
//! a per-call exponential ramp, it's a *shared* estimate of how many pause
//! instructions a contended pointer is likely to need before it changes,
//! refit after every attempt. The MPMC queue and stack use it on their
//! consumer-side retry loop.

use crate::pr;
use core::sync::atomic::{AtomicU32, Ordering};

/// Default initial backoff value.
const DEFAULT_CEILING: u32 = 128;

/// Maximum backoff ceiling.
const MAX_CEILING: u32 = 65536;

/// Exponential backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: u32,
    ceiling: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    /// Create a new backoff state with default parameters.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: 1,
            ceiling: DEFAULT_CEILING,
        }
    }

    /// Create a new backoff state with a custom ceiling.
    #[inline]
    #[must_use]
    pub const fn with_ceiling(ceiling: u32) -> Self {
        Self {
            current: 1,
            ceiling: if ceiling > MAX_CEILING {
                MAX_CEILING
            } else {
                ceiling
            },
        }
    }

    /// Reset the backoff state.
    #[inline]
    pub fn reset(&mut self) {
        self.current = 1;
    }

    /// Perform a spin-wait with exponential backoff.
    ///
    /// This will spin for an increasing number of iterations, doubling
    /// each time until the ceiling is reached.
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..self.current {
            pr::stall();
        }

        if self.current < self.ceiling {
            self.current = self.current.saturating_mul(2);
        }
    }

    /// Spin once without updating state.
    ///
    /// Useful for a quick pause without affecting the backoff progression.
    #[inline]
    pub fn snooze(&self) {
        pr::stall();
    }

    /// Check if we've reached the maximum backoff.
    #[inline]
    #[must_use]
    pub fn is_maxed(&self) -> bool {
        self.current >= self.ceiling
    }

    /// Get the current backoff value.
    #[inline]
    #[must_use]
    pub fn current(&self) -> u32 {
        self.current
    }
}

/// A shared, self-tuning estimate of how long a contended retry loop should
/// pause before resampling the pointer it's waiting on.
///
/// Every MPMC queue and stack keeps exactly one of these alongside its head
/// pointer. Rather than each caller ramping its own backoff from scratch,
/// all consumers feed the same running estimate: `record` compares the
/// number of pause instructions actually spent spinning against the
/// previous estimate and nudges it up (if the spin ran long) or down by one
/// (if it came in under estimate), so the count tracks current contention
/// instead of a fixed schedule. It is intentionally a relaxed, lossy
/// counter — losing an update to a race is cheaper than synchronizing it.
#[derive(Debug)]
pub struct AdaptivePause {
    estimate: AtomicU32,
}

impl Default for AdaptivePause {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptivePause {
    /// Create a new estimator with a one-pause starting estimate.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            estimate: AtomicU32::new(1),
        }
    }

    /// Spin up to the current estimate, calling `done` after each pause to
    /// check whether the awaited condition now holds. Returns the number of
    /// pauses actually spent once `done` reports true, or `None` if the
    /// estimate was exhausted without `done` becoming true.
    #[inline]
    pub fn spin_until(&self, mut done: impl FnMut() -> bool) -> Option<u32> {
        let estimate = self.estimate.load(Ordering::Relaxed);
        for spent in 0..estimate {
            if done() {
                return Some(spent);
            }
            pr::stall();
        }
        None
    }

    /// Refit the shared estimate from an observed spin length.
    ///
    /// If the caller spun `actual` times before the condition became true
    /// and `actual` did not exceed the estimate it started from, the
    /// estimate is allowed to decay by one (contention may be easing). If
    /// `actual` met or exceeded the prior estimate, the estimate jumps
    /// straight to `actual` (contention got worse, catch up immediately
    /// instead of ramping).
    #[inline]
    pub fn record(&self, prior_estimate: u32, actual: u32) {
        if actual <= prior_estimate {
            self.estimate
                .store(prior_estimate.saturating_sub(1).max(1), Ordering::Relaxed);
        } else {
            self.estimate.store(actual, Ordering::Relaxed);
        }
    }

    /// The current estimate, for callers that want to drive their own loop
    /// instead of using [`spin_until`](Self::spin_until).
    #[inline]
    pub fn estimate(&self) -> u32 {
        self.estimate.load(Ordering::Relaxed)
    }
}

/// Simple inline backoff macro for use in tight loops.
#[macro_export]
macro_rules! backoff {
    () => {
        $crate::pr::stall()
    };
    ($count:expr) => {
        for _ in 0..$count {
            $crate::pr::stall();
        }
    };
}
