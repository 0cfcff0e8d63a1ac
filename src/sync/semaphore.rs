//! Counting semaphore.
//!
//! A [`Semaphore`] holds between zero and `max_permits` permits. Acquiring
//! takes one permit, waiting while none are available; releasing returns one.
//! Permits are not tied to threads, so any thread may release, but releasing
//! past the maximum is rejected with [`SyncError::PermitOverflow`].
//!
//! [`SemaphorePermit`] and [`OwnedSemaphorePermit`] return their permit when
//! dropped.

use parking_lot::{Condvar, Mutex as ParkingMutex};
use std::sync::Arc;
use std::time::Duration;

use super::wait::{WaitSpec, wait_until};
use super::{Lockable, report_dropped_while_held};
use crate::cancel::CancelToken;
use crate::config::{SyncConfig, WaitConfig};
use crate::error::{Result, SyncError};
use crate::tracing_compat::{error, trace};

const LOCK_NAME: &str = "semaphore";

#[derive(Debug)]
struct SemaphoreState {
    permits: usize,
    waiters: usize,
    /// Permits taken out of circulation by [`SemaphorePermit::forget`].
    retired: usize,
}

impl SemaphoreState {
    fn outstanding(&self, max_permits: usize) -> usize {
        max_permits - self.permits - self.retired
    }
}

impl SemaphoreState {
    fn try_take(&mut self) -> bool {
        if self.permits == 0 {
            return false;
        }
        self.permits -= 1;
        true
    }
}

/// A counting semaphore bounded by its initial permit count.
#[derive(Debug)]
pub struct Semaphore {
    state: ParkingMutex<SemaphoreState>,
    condvar: Condvar,
    max_permits: usize,
    wait: WaitConfig,
}

impl Semaphore {
    /// Creates a semaphore with `permits` available permits, which is also the
    /// maximum it will ever hold.
    ///
    /// # Panics
    ///
    /// Panics if `permits` is zero; such a semaphore could never be acquired.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self::with_config(permits, &SyncConfig::default())
    }

    /// Creates a semaphore tuned by `config`.
    ///
    /// # Panics
    ///
    /// Panics if `permits` is zero.
    #[must_use]
    pub fn with_config(permits: usize, config: &SyncConfig) -> Self {
        assert!(permits > 0, "semaphore requires at least one permit");
        Self {
            state: ParkingMutex::new(SemaphoreState {
                permits,
                waiters: 0,
                retired: 0,
            }),
            condvar: Condvar::new(),
            max_permits: permits,
            wait: config.wait.clone(),
        }
    }

    /// Returns the number of permits currently available.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.state.lock().permits
    }

    /// Returns the maximum number of permits.
    #[must_use]
    pub const fn max_permits(&self) -> usize {
        self.max_permits
    }

    /// Returns the number of threads currently waiting for a permit.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters
    }

    /// Waits for a permit and returns it as a guard.
    pub fn permit(&self) -> SemaphorePermit<'_> {
        self.acquire();
        SemaphorePermit { semaphore: self }
    }

    /// Takes a permit if one is available right now.
    pub fn try_permit(&self) -> Option<SemaphorePermit<'_>> {
        self.try_acquire()
            .then(|| SemaphorePermit { semaphore: self })
    }

    /// Waits up to `timeout` for a permit.
    pub fn try_permit_for(&self, timeout: Duration) -> Result<SemaphorePermit<'_>> {
        self.try_acquire_for(timeout)?;
        Ok(SemaphorePermit { semaphore: self })
    }

    /// Waits for a permit until `token` is cancelled.
    pub fn permit_cancellable(&self, token: &CancelToken) -> Result<SemaphorePermit<'_>> {
        self.acquire_cancellable(token)?;
        Ok(SemaphorePermit { semaphore: self })
    }

    /// Waits for a permit and returns a guard that keeps the semaphore alive.
    pub fn permit_owned(self: &Arc<Self>) -> OwnedSemaphorePermit {
        self.acquire();
        OwnedSemaphorePermit {
            semaphore: Arc::clone(self),
        }
    }

    fn acquire_with(&self, spec: &WaitSpec<'_>) -> Result<()> {
        let mut state = self.state.lock();
        if state.try_take() {
            return Ok(());
        }

        state.waiters += 1;
        let result = wait_until(&self.condvar, &mut state, spec, SemaphoreState::try_take);
        state.waiters -= 1;
        result
    }

    fn release_permit(&self) -> Result<()> {
        let wake = {
            let mut state = self.state.lock();
            if state.outstanding(self.max_permits) == 0 {
                return Err(SyncError::PermitOverflow {
                    max_permits: self.max_permits,
                });
            }
            state.permits += 1;
            trace!(available = state.permits, "semaphore permit released");
            state.waiters > 0
        };
        if wake {
            self.condvar.notify_one();
        }
        Ok(())
    }

    fn retire_permit(&self) {
        self.state.lock().retired += 1;
    }

    #[cfg_attr(not(feature = "tracing-integration"), allow(unused_variables))]
    fn release_from_guard(&self) {
        if let Err(err) = self.release_permit() {
            error!(error = %err, "semaphore permit guard failed to release");
        }
    }
}

impl Lockable for Semaphore {
    fn acquire(&self) {
        let acquired = self.acquire_with(&WaitSpec::forever());
        debug_assert!(acquired.is_ok(), "unbounded wait cannot fail");
    }

    fn try_acquire(&self) -> bool {
        self.state.lock().try_take()
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

    /// Returns one permit. Any thread may release.
    fn release(&self) -> Result<()> {
        self.release_permit()
    }

    /// Returns true when no permit is available.
    fn is_locked(&self) -> bool {
        self.available_permits() == 0
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if self.state.get_mut().outstanding(self.max_permits) > 0 {
            report_dropped_while_held(LOCK_NAME);
        }
    }
}

/// A permit borrowed from a [`Semaphore`], returned on drop.
#[must_use = "permit will be immediately released if not held"]
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl SemaphorePermit<'_> {
    /// Keeps the permit taken for good.
    ///
    /// The semaphore's capacity shrinks by one: the permit is never returned,
    /// cannot be released back, and does not count as outstanding when the
    /// semaphore is dropped.
    pub fn forget(self) {
        self.semaphore.retire_permit();
        std::mem::forget(self);
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release_from_guard();
    }
}

/// A permit that owns a handle to its [`Semaphore`].
#[must_use = "permit will be immediately released if not held"]
#[derive(Debug)]
pub struct OwnedSemaphorePermit {
    semaphore: Arc<Semaphore>,
}

impl OwnedSemaphorePermit {
    /// Returns the semaphore this permit belongs to.
    #[must_use]
    pub fn semaphore(&self) -> &Arc<Semaphore> {
        &self.semaphore
    }
}

impl Drop for OwnedSemaphorePermit {
    fn drop(&mut self) {
        self.semaphore.release_from_guard();
    }
}
