//! Shared condition-variable wait loop for the blocking primitives.

use parking_lot::{Condvar, MutexGuard};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::{Result, SyncError};

/// How long a blocking acquisition is willing to wait.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitSpec<'a> {
    deadline: Option<(Instant, Duration)>,
    cancel: Option<(&'a CancelToken, Duration)>,
}

impl<'a> WaitSpec<'a> {
    /// Wait until the resource becomes available, however long that takes.
    pub(crate) const fn forever() -> Self {
        Self {
            deadline: None,
            cancel: None,
        }
    }

    /// Give up with `Timeout` after `timeout`.
    ///
    /// A timeout too large to represent as an instant never expires.
    pub(crate) fn timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now()
                .checked_add(timeout)
                .map(|deadline| (deadline, timeout)),
            cancel: None,
        }
    }

    /// Give up with `Interrupted` once `token` is cancelled, re-checking the
    /// token at least every `poll`.
    pub(crate) const fn cancellable(token: &'a CancelToken, poll: Duration) -> Self {
        Self {
            deadline: None,
            cancel: Some((token, poll)),
        }
    }

    /// Returns the error to give up with, if the wait should stop now.
    pub(crate) fn expired(&self, now: Instant) -> Option<SyncError> {
        if let Some((token, _)) = self.cancel {
            if token.is_cancelled() {
                return Some(SyncError::Interrupted);
            }
        }
        match self.deadline {
            Some((deadline, waited)) if now >= deadline => Some(SyncError::Timeout { waited }),
            _ => None,
        }
    }

    /// Returns the instant the next sleep must end by, if any.
    pub(crate) fn next_wake(&self, now: Instant) -> Option<Instant> {
        let poll = self.cancel.map(|(_, poll)| now + poll);
        match (self.deadline.map(|(deadline, _)| deadline), poll) {
            (Some(deadline), Some(poll)) => Some(deadline.min(poll)),
            (deadline, poll) => deadline.or(poll),
        }
    }
}

/// Parks on `condvar` until `try_take` succeeds or `spec` gives up.
///
/// `try_take` runs with the state lock held and must perform the acquisition
/// itself when it returns true, so a resource is never observed free and then
/// lost to another thread. When the wait gives up, one wakeup is passed on in
/// case this waiter consumed a notification meant for someone who can proceed.
pub(crate) fn wait_until<S>(
    condvar: &Condvar,
    state: &mut MutexGuard<'_, S>,
    spec: &WaitSpec<'_>,
    mut try_take: impl FnMut(&mut S) -> bool,
) -> Result<()> {
    loop {
        if try_take(&mut **state) {
            return Ok(());
        }

        let now = Instant::now();
        if let Some(err) = spec.expired(now) {
            condvar.notify_one();
            return Err(err);
        }

        match spec.next_wake(now) {
            Some(wake_at) => {
                let _ = condvar.wait_until(state, wake_at);
            }
            None => condvar.wait(state),
        }
    }
}
