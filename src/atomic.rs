//! Lock-free counter.
//!
//! Every mutation of [`AtomicCounter`] is an explicit compare-and-swap retry
//! loop: read the current value, compute the next one, and try to install it,
//! starting over if another thread got there first. Arithmetic wraps on
//! overflow.
//!
//! ```
//! use std::sync::Arc;
//! use lockstep::AtomicCounter;
//!
//! let counter = Arc::new(AtomicCounter::new(0));
//! let handles: Vec<_> = (0..10)
//!     .map(|_| {
//!         let counter = Arc::clone(&counter);
//!         std::thread::spawn(move || {
//!             for _ in 0..1000 {
//!                 counter.increment();
//!             }
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//! assert_eq!(counter.get(), 10_000);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// A signed 64-bit counter updated by CAS retry loops.
#[derive(Default)]
pub struct AtomicCounter {
    value: AtomicI64,
}

impl AtomicCounter {
    /// Creates a counter holding `initial`.
    #[must_use]
    pub const fn new(initial: i64) -> Self {
        Self {
            value: AtomicI64::new(initial),
        }
    }

    /// Returns the current value.
    #[inline]
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Adds one and returns the new value.
    #[inline]
    pub fn increment(&self) -> i64 {
        self.add(1)
    }

    /// Subtracts one and returns the new value.
    #[inline]
    pub fn decrement(&self) -> i64 {
        self.add(-1)
    }

    /// Adds `delta` and returns the new value.
    pub fn add(&self, delta: i64) -> i64 {
        self.update(|current| current.wrapping_add(delta))
    }

    /// Stores `new` only if the counter currently holds `expected`.
    ///
    /// Returns true if the value was replaced.
    pub fn compare_and_swap(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Applies `f` to the current value until the result is installed
    /// atomically, and returns the installed value.
    ///
    /// `f` may run more than once under contention, so it must be pure.
    pub fn update(&self, mut f: impl FnMut(i64) -> i64) -> i64 {
        let mut current = self.value.load(Ordering::Relaxed);
        loop {
            let next = f(current);
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// Sets the counter to zero and returns the value it held.
    pub fn reset(&self) -> i64 {
        let mut current = self.value.load(Ordering::Relaxed);
        loop {
            match self
                .value
                .compare_exchange_weak(current, 0, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(previous) => return previous,
                Err(observed) => current = observed,
            }
        }
    }
}

impl fmt::Debug for AtomicCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicCounter").field(&self.get()).finish()
    }
}

impl From<i64> for AtomicCounter {
    fn from(initial: i64) -> Self {
        Self::new(initial)
    }
}
