//! Reentrant mutual exclusion.
//!
//! The owning thread may acquire a [`RawReentrantLock`] any number of times;
//! the lock becomes free only after the same number of releases. Other threads
//! wait until the hold count returns to zero.
//!
//! Because the owner can hold several guards at once, [`ReentrantLock`] hands
//! out shared references only. Wrap the value in a `Cell` or `RefCell` for
//! interior mutation.

use parking_lot::{Condvar, Mutex as ParkingMutex};
use std::marker::PhantomData;
use std::ops::Deref;
use std::time::Duration;

use super::wait::{WaitSpec, wait_until};
use super::{Lockable, current_thread_token, report_dropped_while_held};
use crate::cancel::CancelToken;
use crate::config::{SyncConfig, WaitConfig};
use crate::error::{Result, SyncError};

const LOCK_NAME: &str = "reentrant lock";

#[derive(Debug, Default)]
struct ReentrantState {
    owner: Option<usize>,
    /// Outstanding acquisitions by `owner`; zero iff `owner` is `None`.
    count: u32,
    waiters: usize,
}

impl ReentrantState {
    /// Takes or re-enters the lock for `me` if possible.
    fn try_take(&mut self, me: usize) -> bool {
        match self.owner {
            None => {
                self.owner = Some(me);
                self.count = 1;
                true
            }
            Some(owner) if owner == me => {
                self.count = self
                    .count
                    .checked_add(1)
                    .unwrap_or_else(|| panic!("{LOCK_NAME} hold count overflow"));
                true
            }
            Some(_) => false,
        }
    }
}

/// An owner-tracking lock that its owner may acquire repeatedly.
#[derive(Debug)]
pub struct RawReentrantLock {
    state: ParkingMutex<ReentrantState>,
    condvar: Condvar,
    wait: WaitConfig,
}

impl RawReentrantLock {
    /// Creates a new unlocked reentrant lock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&SyncConfig::default())
    }

    /// Creates a new unlocked reentrant lock tuned by `config`.
    #[must_use]
    pub fn with_config(config: &SyncConfig) -> Self {
        Self {
            state: ParkingMutex::new(ReentrantState::default()),
            condvar: Condvar::new(),
            wait: config.wait.clone(),
        }
    }

    /// Returns how many times the calling thread currently holds the lock.
    #[must_use]
    pub fn hold_count(&self) -> u32 {
        let state = self.state.lock();
        if state.owner == Some(current_thread_token()) {
            state.count
        } else {
            0
        }
    }

    /// Returns the number of threads currently waiting for the lock.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters
    }

    fn acquire_with(&self, spec: &WaitSpec<'_>) -> Result<()> {
        let me = current_thread_token();
        let mut state = self.state.lock();
        if state.try_take(me) {
            return Ok(());
        }

        state.waiters += 1;
        let result = wait_until(&self.condvar, &mut state, spec, |state| state.try_take(me));
        state.waiters -= 1;
        result
    }
}

impl Default for RawReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lockable for RawReentrantLock {
    fn acquire(&self) {
        let acquired = self.acquire_with(&WaitSpec::forever());
        debug_assert!(acquired.is_ok(), "unbounded wait cannot fail");
    }

    fn try_acquire(&self) -> bool {
        self.state.lock().try_take(current_thread_token())
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
            state.count -= 1;
            if state.count > 0 {
                return Ok(());
            }
            state.owner = None;
            state.waiters > 0
        };
        if wake {
            self.condvar.notify_one();
        }
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }
}

impl Drop for RawReentrantLock {
    fn drop(&mut self) {
        if self.state.get_mut().owner.is_some() {
            report_dropped_while_held(LOCK_NAME);
        }
    }
}

/// A reentrant lock protecting a value of type `T`.
#[derive(Debug, Default)]
pub struct ReentrantLock<T> {
    raw: RawReentrantLock,
    data: T,
}

// Safety: guards only give out `&T`, and only on the thread holding `raw`.
// `T: Send` is required because that thread may differ from the creator.
#[allow(unsafe_code)]
unsafe impl<T: Send> Sync for ReentrantLock<T> {}

impl<T> ReentrantLock<T> {
    /// Creates a new unlocked reentrant lock.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self::with_config(value, &SyncConfig::default())
    }

    /// Creates a new unlocked reentrant lock tuned by `config`.
    #[must_use]
    pub fn with_config(value: T, config: &SyncConfig) -> Self {
        Self {
            raw: RawReentrantLock::with_config(config),
            data: value,
        }
    }

    /// Acquires the lock, blocking unless the calling thread already owns it.
    pub fn lock(&self) -> ReentrantLockGuard<'_, T> {
        self.raw.acquire();
        ReentrantLockGuard::new(self)
    }

    /// Acquires the lock if that is possible without waiting.
    pub fn try_lock(&self) -> Option<ReentrantLockGuard<'_, T>> {
        self.raw.try_acquire().then(|| ReentrantLockGuard::new(self))
    }

    /// Acquires the lock, giving up with `Timeout` after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<ReentrantLockGuard<'_, T>> {
        self.raw.try_acquire_for(timeout)?;
        Ok(ReentrantLockGuard::new(self))
    }

    /// Acquires the lock, giving up with `Interrupted` once `token` is cancelled.
    pub fn lock_cancellable(&self, token: &CancelToken) -> Result<ReentrantLockGuard<'_, T>> {
        self.raw.acquire_cancellable(token)?;
        Ok(ReentrantLockGuard::new(self))
    }

    /// Returns how many times the calling thread currently holds the lock.
    #[must_use]
    pub fn hold_count(&self) -> u32 {
        self.raw.hold_count()
    }

    /// Returns true if any thread holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Returns a mutable reference to the underlying data.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.data
    }

    /// Consumes the lock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data
    }
}

/// A guard for one acquisition of a [`ReentrantLock`].
#[must_use = "guard will be immediately released if not held"]
pub struct ReentrantLockGuard<'a, T> {
    lock: &'a ReentrantLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> ReentrantLockGuard<'a, T> {
    fn new(lock: &'a ReentrantLock<T>) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ReentrantLockGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReentrantLockGuard")
            .field("data", &self.lock.data)
            .finish()
    }
}

impl<T> Deref for ReentrantLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.lock.data
    }
}

impl<T> Drop for ReentrantLockGuard<'_, T> {
    fn drop(&mut self) {
        let released = self.lock.raw.release();
        debug_assert!(released.is_ok(), "guard released by its owner");
    }
}
