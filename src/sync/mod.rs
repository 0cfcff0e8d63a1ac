//! Blocking and spinning synchronization primitives.
//!
//! Every lock in this module exists in two forms:
//!
//! - A **raw** form ([`RawMutex`], [`RawReentrantLock`], [`RawRwLock`],
//!   [`RawSpinLock`], and [`Semaphore`] itself) that implements the
//!   [`Lockable`] capability. Raw locks track their owner and reject releases
//!   from any other thread with [`SyncError::NotOwner`].
//! - A **data** form ([`Mutex`], [`ReentrantLock`], [`RwLock`], [`SpinLock`])
//!   that protects a value and hands out RAII guards. Guards release on every
//!   exit path, including unwinding, and are `!Send` so the release always
//!   happens on the owning thread.
//!
//! # Waiting
//!
//! Blocking acquisitions park the caller on a condition variable. Each blocking
//! operation has three flavours:
//!
//! - unbounded (`acquire`, `lock`, `read`, `write`)
//! - timed (`try_acquire_for`, `try_lock_for`, ...), failing with
//!   [`SyncError::Timeout`]
//! - cancellable (`acquire_cancellable`, `lock_cancellable`, ...), failing with
//!   [`SyncError::Interrupted`]
//!
//! A waiter that gives up leaves no trace in the primitive: it never acquires
//! the resource after returning failure.
//!
//! # Fairness
//!
//! [`Mutex`], [`ReentrantLock`] and [`Semaphore`] do not queue waiters in
//! FIFO order; a releasing thread wakes one waiter and a newly arriving thread
//! may barge ahead of it. [`RwLock`] is writer-preferring with FIFO order among
//! writers, see its documentation.

mod mutex;
mod reentrant;
mod rwlock;
mod semaphore;
mod spin;
mod wait;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::Result;

pub use mutex::{Mutex, MutexGuard, RawMutex};
pub use reentrant::{RawReentrantLock, ReentrantLock, ReentrantLockGuard};
pub use rwlock::{RawRwLock, ReadSide, RwLock, RwLockReadGuard, RwLockWriteGuard, WriteSide};
pub use semaphore::{OwnedSemaphorePermit, Semaphore, SemaphorePermit};
pub use spin::{RawSpinLock, SpinLock, SpinLockGuard};

/// The acquire/release capability shared by every lock variant.
///
/// Implementors share no state or base type; reentrancy, permit counting and
/// reader sharing keep their own invariants behind this interface.
pub trait Lockable: Send + Sync {
    /// Blocks until the lock is held by the calling thread.
    fn acquire(&self);

    /// Acquires the lock only if that is possible without waiting.
    fn try_acquire(&self) -> bool;

    /// Acquires the lock, giving up with [`SyncError::Timeout`] after `timeout`.
    ///
    /// [`SyncError::Timeout`]: crate::SyncError::Timeout
    fn try_acquire_for(&self, timeout: Duration) -> Result<()>;

    /// Acquires the lock, giving up with [`SyncError::Interrupted`] once
    /// `token` is cancelled.
    ///
    /// [`SyncError::Interrupted`]: crate::SyncError::Interrupted
    fn acquire_cancellable(&self, token: &CancelToken) -> Result<()>;

    /// Releases one acquisition made by the calling thread.
    fn release(&self) -> Result<()>;

    /// Returns true if the lock is currently held by any thread.
    fn is_locked(&self) -> bool;
}

/// Returns a token identifying the calling thread, never zero.
///
/// Tokens are drawn once per thread from a global counter and never reused,
/// so a thread started after another exits cannot pass for the dead owner.
#[inline]
pub(crate) fn current_thread_token() -> usize {
    static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(1);
    thread_local! {
        static TOKEN: usize = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|token| *token)
}

/// Reports a raw primitive dropped while still held.
///
/// Dropping a held lock is a programmer error: any waiter would block forever.
/// It is logged, and panics in debug builds unless the thread is unwinding.
pub(crate) fn report_dropped_while_held(lock: &'static str) {
    if std::thread::panicking() {
        return;
    }
    crate::tracing_compat::error!(lock, "lock dropped while held");
    if cfg!(debug_assertions) {
        panic!("{lock} dropped while held");
    }
}
