//! Non-reentrant mutual exclusion.
//!
//! [`RawMutex`] is the owner-tracking lock; [`Mutex`] pairs it with the data it
//! protects.
//!
//! The mutex is **not** reentrant: a thread that calls
//! [`Mutex::lock`] while already holding the lock waits for itself forever.
//! Use [`ReentrantLock`](crate::ReentrantLock) when re-acquisition by the owner
//! is needed.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use lockstep::Mutex;
//!
//! let counter = Arc::new(Mutex::new(0_u32));
//! let handles: Vec<_> = (0..4)
//!     .map(|_| {
//!         let counter = Arc::clone(&counter);
//!         std::thread::spawn(move || {
//!             for _ in 0..1000 {
//!                 *counter.lock() += 1;
//!             }
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//! assert_eq!(*counter.lock(), 4000);
//! ```

#![allow(unsafe_code)]

use parking_lot::{Condvar, Mutex as ParkingMutex};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use super::wait::{WaitSpec, wait_until};
use super::{Lockable, current_thread_token, report_dropped_while_held};
use crate::cancel::CancelToken;
use crate::config::{SyncConfig, WaitConfig};
use crate::error::{Result, SyncError};

const LOCK_NAME: &str = "mutex";

#[derive(Debug, Default)]
struct MutexState {
    /// Token of the owning thread, if locked.
    owner: Option<usize>,
    /// Threads currently parked in an acquisition.
    waiters: usize,
}

/// An owner-tracking exclusive lock without associated data.
#[derive(Debug)]
pub struct RawMutex {
    state: ParkingMutex<MutexState>,
    condvar: Condvar,
    wait: WaitConfig,
}

impl RawMutex {
    /// Creates a new unlocked mutex.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&SyncConfig::default())
    }

    /// Creates a new unlocked mutex tuned by `config`.
    #[must_use]
    pub fn with_config(config: &SyncConfig) -> Self {
        Self {
            state: ParkingMutex::new(MutexState::default()),
            condvar: Condvar::new(),
            wait: config.wait.clone(),
        }
    }

    /// Returns the number of threads currently waiting for the lock.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters
    }

    /// Returns true if the calling thread owns the lock.
    #[must_use]
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(current_thread_token())
    }

    fn acquire_with(&self, spec: &WaitSpec<'_>) -> Result<()> {
        let me = current_thread_token();
        let mut state = self.state.lock();
        if state.owner.is_none() {
            state.owner = Some(me);
            return Ok(());
        }

        state.waiters += 1;
        let result = wait_until(&self.condvar, &mut state, spec, |state| {
            if state.owner.is_none() {
                state.owner = Some(me);
                true
            } else {
                false
            }
        });
        state.waiters -= 1;
        result
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Lockable for RawMutex {
    fn acquire(&self) {
        let acquired = self.acquire_with(&WaitSpec::forever());
        debug_assert!(acquired.is_ok(), "unbounded wait cannot fail");
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.owner.is_some() {
            return false;
        }
        state.owner = Some(current_thread_token());
        true
    }

    fn try_acquire_for(&self, timeout: Duration) -> Result<()> {
        self.acquire_with(&WaitSpec::timeout(timeout))
    }

    fn acquire_cancellable(&self, token: &CancelToken) -> Result<()> {
        self.acquire_with(&WaitSpec::cancellable(
            token,
            self.wait.cancel_poll_interval,
        ))
    }

    fn release(&self) -> Result<()> {
        let wake = {
            let mut state = self.state.lock();
            if state.owner != Some(current_thread_token()) {
                return Err(SyncError::NotOwner { lock: LOCK_NAME });
            }
            state.owner = None;
            state.waiters > 0
        };
        // Notify outside the state lock so the woken thread can take it at once.
        if wake {
            self.condvar.notify_one();
        }
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }
}

impl Drop for RawMutex {
    fn drop(&mut self) {
        if self.state.get_mut().owner.is_some() {
            report_dropped_while_held(LOCK_NAME);
        }
    }
}

/// A mutual exclusion lock protecting a value of type `T`.
#[derive(Debug)]
pub struct Mutex<T> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by `raw`.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self::with_config(value, &SyncConfig::default())
    }

    /// Creates a new mutex tuned by `config`.
    #[must_use]
    pub fn with_config(value: T, config: &SyncConfig) -> Self {
        Self {
            raw: RawMutex::with_config(config),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the mutex, blocking the current thread until it is available.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.acquire();
        MutexGuard::new(self)
    }

    /// Acquires the mutex only if it is free right now.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.raw.try_acquire().then(|| MutexGuard::new(self))
    }

    /// Acquires the mutex, giving up with `Timeout` after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<MutexGuard<'_, T>> {
        self.raw.try_acquire_for(timeout)?;
        Ok(MutexGuard::new(self))
    }

    /// Acquires the mutex, giving up with `Interrupted` once `token` is cancelled.
    pub fn lock_cancellable(&self, token: &CancelToken) -> Result<MutexGuard<'_, T>> {
        self.raw.acquire_cancellable(token)?;
        Ok(MutexGuard::new(self))
    }

    /// Returns true if the mutex is currently locked.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Returns the number of threads currently waiting for the lock.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.raw.waiters()
    }

    /// Returns a mutable reference to the underlying data.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// A guard that releases the mutex when dropped.
#[must_use = "guard will be immediately released if not held"]
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: Sync> Sync for MutexGuard<'_, T> {}

impl<'a, T> MutexGuard<'a, T> {
    fn new(mutex: &'a Mutex<T>) -> Self {
        Self {
            mutex,
            _not_send: PhantomData,
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexGuard").field("data", &**self).finish()
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        let released = self.mutex.raw.release();
        debug_assert!(released.is_ok(), "guard released by its owner");
    }
}
