//! Busy-waiting lock.
//!
//! [`RawSpinLock`] never parks: a waiting thread spins on the lock word with
//! exponential backoff and falls back to `yield_now` once a burst would exceed
//! [`SpinConfig::spins_before_yield`](crate::config::SpinConfig). Use it for
//! critical sections that are a handful of instructions long.
//!
//! The lock word stores the owner's thread token, so releases by any other
//! thread are rejected.

use std::cell::UnsafeCell;
use std::hint;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::{Lockable, current_thread_token, report_dropped_while_held};
use crate::cancel::CancelToken;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

const LOCK_NAME: &str = "spin lock";
const UNLOCKED: usize = 0;

/// Exponential spin backoff that degrades to yielding the thread.
#[derive(Debug)]
struct Backoff {
    step: u32,
    spins_before_yield: u32,
}

impl Backoff {
    const fn new(spins_before_yield: u32) -> Self {
        Self {
            step: 0,
            spins_before_yield,
        }
    }

    fn snooze(&mut self) {
        match 1_u32.checked_shl(self.step) {
            Some(burst) if burst <= self.spins_before_yield => {
                for _ in 0..burst {
                    hint::spin_loop();
                }
                self.step += 1;
            }
            _ => std::thread::yield_now(),
        }
    }
}

/// An owner-tracking spin lock without associated data.
#[derive(Debug)]
pub struct RawSpinLock {
    owner: AtomicUsize,
    spins_before_yield: u32,
}

impl RawSpinLock {
    /// Creates a new unlocked spin lock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&SyncConfig::default())
    }

    /// Creates a new unlocked spin lock tuned by `config`.
    #[must_use]
    pub fn with_config(config: &SyncConfig) -> Self {
        Self {
            owner: AtomicUsize::new(UNLOCKED),
            spins_before_yield: config.spin.spins_before_yield,
        }
    }

    /// Spins until the lock is held.
    pub fn lock(&self) {
        let me = current_thread_token();
        let mut backoff = Backoff::new(self.spins_before_yield);
        while !self.try_take(me) {
            self.wait_unlocked(&mut backoff, || false);
        }
    }

    /// Takes the lock if it is free.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.try_take(current_thread_token())
    }

    /// Spins until the lock is held or `timeout` elapses.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<()> {
        let me = current_thread_token();
        let deadline = Instant::now().checked_add(timeout);
        let expired = || deadline.is_some_and(|deadline| Instant::now() >= deadline);
        let mut backoff = Backoff::new(self.spins_before_yield);
        loop {
            if self.try_take(me) {
                return Ok(());
            }
            if expired() {
                return Err(SyncError::Timeout { waited: timeout });
            }
            self.wait_unlocked(&mut backoff, expired);
        }
    }

    /// Releases the lock held by the calling thread.
    pub fn unlock(&self) -> Result<()> {
        self.owner
            .compare_exchange(
                current_thread_token(),
                UNLOCKED,
                Ordering::Release,
                Ordering::Relaxed,
            )
            .map(|_| ())
            .map_err(|_| SyncError::NotOwner { lock: LOCK_NAME })
    }

    /// Returns true if any thread holds the lock.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != UNLOCKED
    }

    #[inline]
    fn try_take(&self, me: usize) -> bool {
        self.owner
            .compare_exchange(UNLOCKED, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spins on plain loads until the lock looks free or `give_up` says stop,
    /// so contended waiters do not hammer the cache line with CAS attempts.
    fn wait_unlocked(&self, backoff: &mut Backoff, mut give_up: impl FnMut() -> bool) {
        while self.is_locked() && !give_up() {
            backoff.snooze();
        }
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lockable for RawSpinLock {
    fn acquire(&self) {
        self.lock();
    }

    fn try_acquire(&self) -> bool {
        self.try_lock()
    }

    fn try_acquire_for(&self, timeout: Duration) -> Result<()> {
        self.try_lock_for(timeout)
    }

    fn acquire_cancellable(&self, token: &CancelToken) -> Result<()> {
        let me = current_thread_token();
        let mut backoff = Backoff::new(self.spins_before_yield);
        loop {
            if self.try_take(me) {
                return Ok(());
            }
            if token.is_cancelled() {
                return Err(SyncError::Interrupted);
            }
            self.wait_unlocked(&mut backoff, || token.is_cancelled());
        }
    }

    fn release(&self) -> Result<()> {
        self.unlock()
    }

    fn is_locked(&self) -> bool {
        Self::is_locked(self)
    }
}

impl Drop for RawSpinLock {
    fn drop(&mut self) {
        if *self.owner.get_mut() != UNLOCKED {
            report_dropped_while_held(LOCK_NAME);
        }
    }
}

/// A spin lock protecting a value of type `T`.
#[derive(Debug, Default)]
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by `raw`.
#[allow(unsafe_code)]
unsafe impl<T: Send> Send for SpinLock<T> {}
#[allow(unsafe_code)]
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new unlocked spin lock.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self::with_config(value, &SyncConfig::default())
    }

    /// Creates a new unlocked spin lock tuned by `config`.
    #[must_use]
    pub fn with_config(value: T, config: &SyncConfig) -> Self {
        Self {
            raw: RawSpinLock::with_config(config),
            data: UnsafeCell::new(value),
        }
    }

    /// Spins until the lock is held.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard::new(self)
    }

    /// Takes the lock if it is free.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.raw.try_lock().then(|| SpinLockGuard::new(self))
    }

    /// Spins until the lock is held or `timeout` elapses.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<SpinLockGuard<'_, T>> {
        self.raw.try_lock_for(timeout)?;
        Ok(SpinLockGuard::new(self))
    }

    /// Returns true if any thread holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Returns a mutable reference to the underlying data.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the lock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// A guard that releases the spin lock when dropped.
#[must_use = "guard will be immediately released if not held"]
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    fn new(lock: &'a SpinLock<T>) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    #[allow(unsafe_code)]
    fn deref(&self) -> &T {
        // Safety: the guard proves exclusive ownership of the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    #[allow(unsafe_code)]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for SpinLockGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpinLockGuard").field("data", &**self).finish()
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        let released = self.lock.raw.unlock();
        debug_assert!(released.is_ok(), "guard released by its owner");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Profile;
    use std::sync::Arc;

    #[test]
    fn lock_and_unlock() {
        let lock = RawSpinLock::new();
        assert!(!lock.is_locked());
        lock.lock();
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        lock.unlock().expect("owner unlock");
        assert!(!lock.is_locked());
    }

    #[test]
    fn unlock_by_non_owner_rejected() {
        let lock = Arc::new(RawSpinLock::new());
        lock.lock();
        let other = Arc::clone(&lock);
        let result = std::thread::spawn(move || other.unlock())
            .join()
            .expect("thread join");
        assert_eq!(result, Err(SyncError::NotOwner { lock: LOCK_NAME }));
        assert!(lock.is_locked());
        lock.unlock().expect("owner unlock");

        // Unlocking a free lock is also rejected.
        assert_eq!(
            lock.unlock(),
            Err(SyncError::NotOwner { lock: LOCK_NAME })
        );
    }

    #[test]
    fn try_lock_for_times_out_while_held() {
        let lock = Arc::new(RawSpinLock::new());
        lock.lock();
        let other = Arc::clone(&lock);
        let start = Instant::now();
        let result = std::thread::spawn(move || other.try_lock_for(Duration::from_millis(20)))
            .join()
            .expect("thread join");
        assert!(matches!(result, Err(SyncError::Timeout { .. })));
        assert!(start.elapsed() >= Duration::from_millis(20));
        lock.unlock().expect("owner unlock");
    }

    #[test]
    fn cancelled_spin_gives_up() {
        let lock = RawSpinLock::new();
        lock.lock();
        let token = CancelToken::new();
        token.cancel();
        // The owner cannot take its own lock again; cancellation ends the spin.
        assert_eq!(lock.acquire_cancellable(&token), Err(SyncError::Interrupted));
        lock.unlock().expect("owner unlock");
    }

    #[test]
    fn backoff_yields_after_limit() {
        let mut backoff = Backoff::new(8);
        for _ in 0..10 {
            backoff.snooze();
        }
        // 1, 2, 4, 8 spin bursts, then yields without growing further.
        assert_eq!(backoff.step, 4);
    }

    #[test]
    fn guard_protects_data_under_contention() {
        let config = Profile::LowLatency.to_config();
        let lock = Arc::new(SpinLock::with_config(0_u64, &config));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread join failed");
        }
        assert_eq!(*lock.lock(), 8_000);
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_lock_guard() {
        let mut lock = SpinLock::new(String::from("a"));
        {
            let mut guard = lock.try_lock().expect("free lock");
            guard.push('b');
            assert!(lock.try_lock().is_none());
        }
        lock.get_mut().push('c');
        assert_eq!(lock.into_inner(), "abc");
    }
}
