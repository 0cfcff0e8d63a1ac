//! Locks bound to a rank.

#![allow(unsafe_code)]

use smallvec::SmallVec;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use super::{LockOrderingCoordinator, LockRank, RankedLock};
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::sync::{Lockable, RawMutex};

/// A [`Lockable`] whose acquisitions are checked against a coordinator.
///
/// Every acquisition consults the coordinator *before* waiting, so an
/// out-of-order request fails without ever blocking.
#[derive(Debug)]
pub struct OrderedLock<L: Lockable> {
    lock: L,
    rank: LockRank,
    coordinator: Arc<LockOrderingCoordinator>,
}

impl<L: Lockable> OrderedLock<L> {
    /// Wraps `lock` with the next rank issued by `coordinator`.
    pub fn new(coordinator: &Arc<LockOrderingCoordinator>, lock: L) -> Self {
        Self {
            rank: coordinator.register_lock(),
            lock,
            coordinator: Arc::clone(coordinator),
        }
    }

    /// Wraps `lock` with an explicit rank.
    pub fn with_rank(coordinator: &Arc<LockOrderingCoordinator>, lock: L, rank: u64) -> Self {
        Self {
            rank: coordinator.register_lock_with_rank(rank),
            lock,
            coordinator: Arc::clone(coordinator),
        }
    }

    /// Returns this lock's rank.
    #[must_use]
    pub const fn rank(&self) -> LockRank {
        self.rank
    }

    /// Returns the wrapped lock.
    #[must_use]
    pub const fn inner(&self) -> &L {
        &self.lock
    }

    /// Blocks until the lock is held.
    ///
    /// # Errors
    ///
    /// Returns `LockOrderViolation` without waiting if the calling thread holds
    /// a rank at or above this one and the policy is `Enforce`.
    pub fn acquire(&self) -> Result<OrderedGuard<'_, L>> {
        self.coordinator.before_acquire(self.rank)?;
        self.lock.acquire();
        Ok(self.acquired())
    }

    /// Acquires the lock if that is possible without waiting.
    ///
    /// # Errors
    ///
    /// Returns `LockOrderViolation` as for [`acquire`](Self::acquire).
    pub fn try_acquire(&self) -> Result<Option<OrderedGuard<'_, L>>> {
        self.coordinator.admit(self.rank)?;
        Ok(self.lock.try_acquire().then(|| self.acquired()))
    }

    /// Waits up to `timeout` for the lock.
    ///
    /// # Errors
    ///
    /// Returns `LockOrderViolation` as for [`acquire`](Self::acquire), or
    /// `Timeout` when the wait expires.
    pub fn try_acquire_for(&self, timeout: Duration) -> Result<OrderedGuard<'_, L>> {
        self.coordinator.before_acquire(self.rank)?;
        self.settle(self.lock.try_acquire_for(timeout))
    }

    /// Waits for the lock until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `LockOrderViolation` as for [`acquire`](Self::acquire), or
    /// `Interrupted` when cancelled.
    pub fn acquire_cancellable(&self, token: &CancelToken) -> Result<OrderedGuard<'_, L>> {
        self.coordinator.before_acquire(self.rank)?;
        self.settle(self.lock.acquire_cancellable(token))
    }

    fn settle(&self, outcome: Result<()>) -> Result<OrderedGuard<'_, L>> {
        match outcome {
            Ok(()) => Ok(self.acquired()),
            Err(err) => {
                self.coordinator.on_abandoned(self.rank);
                Err(err)
            }
        }
    }

    fn acquired(&self) -> OrderedGuard<'_, L> {
        self.coordinator.on_acquired(self.rank);
        OrderedGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    fn release(&self) {
        let released = self.lock.release();
        debug_assert!(released.is_ok(), "ordered guard released by its owner");
        self.coordinator.on_released(self.rank);
    }
}

impl<L: Lockable> RankedLock for OrderedLock<L> {
    fn rank(&self) -> LockRank {
        self.rank
    }

    fn coordinator(&self) -> &LockOrderingCoordinator {
        &self.coordinator
    }

    fn lockable(&self) -> &dyn Lockable {
        &self.lock
    }
}

/// Holds an [`OrderedLock`] until dropped.
#[must_use = "guard will be immediately released if not held"]
#[derive(Debug)]
pub struct OrderedGuard<'a, L: Lockable> {
    lock: &'a OrderedLock<L>,
    _not_send: PhantomData<*const ()>,
}

impl<L: Lockable> OrderedGuard<'_, L> {
    /// Returns the rank being held.
    #[must_use]
    pub fn rank(&self) -> LockRank {
        self.lock.rank
    }
}

impl<L: Lockable> Drop for OrderedGuard<'_, L> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// A mutex protecting a `T`, bound to a rank.
#[derive(Debug)]
pub struct OrderedMutex<T> {
    lock: OrderedLock<RawMutex>,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by the inner mutex.
unsafe impl<T: Send> Send for OrderedMutex<T> {}
unsafe impl<T: Send> Sync for OrderedMutex<T> {}

impl<T> OrderedMutex<T> {
    /// Creates a mutex with the next rank issued by `coordinator`.
    pub fn new(coordinator: &Arc<LockOrderingCoordinator>, value: T) -> Self {
        Self {
            lock: OrderedLock::new(coordinator, RawMutex::new()),
            data: UnsafeCell::new(value),
        }
    }

    /// Creates a mutex with an explicit rank.
    pub fn with_rank(coordinator: &Arc<LockOrderingCoordinator>, value: T, rank: u64) -> Self {
        Self {
            lock: OrderedLock::with_rank(coordinator, RawMutex::new(), rank),
            data: UnsafeCell::new(value),
        }
    }

    /// Returns this mutex's rank.
    #[must_use]
    pub const fn rank(&self) -> LockRank {
        self.lock.rank
    }

    /// Returns true if the mutex is held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.lock.is_locked()
    }

    /// Blocks until the mutex is held.
    ///
    /// # Errors
    ///
    /// Returns `LockOrderViolation`, without waiting, if the calling thread
    /// holds a rank at or above this one and the policy is `Enforce`.
    pub fn lock(&self) -> Result<OrderedMutexGuard<'_, T>> {
        let guard = self.lock.acquire()?;
        Ok(OrderedMutexGuard::new(self, guard))
    }

    /// Waits up to `timeout` for the mutex.
    ///
    /// # Errors
    ///
    /// `LockOrderViolation` as for [`lock`](Self::lock), or `Timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<OrderedMutexGuard<'_, T>> {
        let guard = self.lock.try_acquire_for(timeout)?;
        Ok(OrderedMutexGuard::new(self, guard))
    }

    /// Waits for the mutex until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// `LockOrderViolation` as for [`lock`](Self::lock), or `Interrupted`.
    pub fn lock_cancellable(&self, token: &CancelToken) -> Result<OrderedMutexGuard<'_, T>> {
        let guard = self.lock.acquire_cancellable(token)?;
        Ok(OrderedMutexGuard::new(self, guard))
    }

    /// Locks `self` and `other` together, in rank order, all or nothing.
    ///
    /// The guards are returned in argument order regardless of rank.
    ///
    /// # Errors
    ///
    /// As for [`LockOrderingCoordinator::acquire_all`].
    ///
    /// # Panics
    ///
    /// Panics if the two mutexes were ranked by different coordinators.
    pub fn lock_pair<'a, U>(
        &'a self,
        other: &'a OrderedMutex<U>,
    ) -> Result<(OrderedMutexGuard<'a, T>, OrderedMutexGuard<'a, U>)> {
        let set = self.lock.coordinator.acquire_all(&[self, other])?;
        set.disarm();
        let mine = OrderedGuard {
            lock: &self.lock,
            _not_send: PhantomData,
        };
        let theirs = OrderedGuard {
            lock: &other.lock,
            _not_send: PhantomData,
        };
        Ok((
            OrderedMutexGuard::new(self, mine),
            OrderedMutexGuard::new(other, theirs),
        ))
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

impl<T> RankedLock for OrderedMutex<T> {
    fn rank(&self) -> LockRank {
        self.lock.rank
    }

    fn coordinator(&self) -> &LockOrderingCoordinator {
        &self.lock.coordinator
    }

    fn lockable(&self) -> &dyn Lockable {
        &self.lock.lock
    }
}

/// Access to an [`OrderedMutex`]'s data, released on drop.
#[must_use = "guard will be immediately released if not held"]
pub struct OrderedMutexGuard<'a, T> {
    mutex: &'a OrderedMutex<T>,
    _guard: OrderedGuard<'a, RawMutex>,
}

impl<'a, T> OrderedMutexGuard<'a, T> {
    fn new(mutex: &'a OrderedMutex<T>, guard: OrderedGuard<'a, RawMutex>) -> Self {
        Self {
            mutex,
            _guard: guard,
        }
    }
}

impl<T> Deref for OrderedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the inner guard proves the mutex is held by this thread.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for OrderedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the inner guard proves the mutex is held by this thread.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for OrderedMutexGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedMutexGuard")
            .field("rank", &self.mutex.rank())
            .field("data", &**self)
            .finish()
    }
}

/// Holds every lock taken by [`LockOrderingCoordinator::acquire_all`].
///
/// Dropping the guard releases the locks in reverse rank order.
#[must_use = "locks will be immediately released if not held"]
pub struct MultiLockGuard<'a> {
    locks: SmallVec<[&'a dyn RankedLock; 4]>,
    _not_send: PhantomData<*const ()>,
}

impl<'a> MultiLockGuard<'a> {
    pub(super) fn new(locks: SmallVec<[&'a dyn RankedLock; 4]>) -> Self {
        Self {
            locks,
            _not_send: PhantomData,
        }
    }

    /// Returns the held ranks in acquisition order.
    #[must_use]
    pub fn ranks(&self) -> Vec<LockRank> {
        self.locks.iter().map(|lock| lock.rank()).collect()
    }

    /// Gives up responsibility for releasing; the caller now owns every lock.
    fn disarm(mut self) {
        self.locks.clear();
    }
}

impl std::fmt::Debug for MultiLockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiLockGuard")
            .field("ranks", &self.ranks())
            .finish()
    }
}

impl Drop for MultiLockGuard<'_> {
    fn drop(&mut self) {
        for lock in self.locks.iter().rev() {
            let released = lock.lockable().release();
            debug_assert!(released.is_ok(), "multi-lock guard releases its own locks");
            lock.coordinator().on_released(lock.rank());
        }
    }
}
