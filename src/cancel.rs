//! Cooperative cancellation for blocking waits.
//!
//! A [`CancelToken`] is shared between the thread that may need to abandon a
//! wait and the threads doing the waiting. Cancelling is sticky: once
//! cancelled, every cancellable acquisition using the token returns
//! [`SyncError::Interrupted`](crate::SyncError::Interrupted) without taking
//! the resource.
//!
//! Waiters observe cancellation at most one
//! [`cancel_poll_interval`](crate::config::WaitConfig::cancel_poll_interval)
//! after it is requested.
//!
//! ```
//! use std::sync::Arc;
//! use lockstep::{CancelToken, Mutex, SyncError};
//!
//! let mutex = Arc::new(Mutex::new(0));
//! let token = CancelToken::new();
//! let _held = mutex.lock();
//!
//! let waiter = {
//!     let mutex = Arc::clone(&mutex);
//!     let token = token.clone();
//!     std::thread::spawn(move || mutex.lock_cancellable(&token).map(|_| ()))
//! };
//! token.cancel();
//! assert_eq!(waiter.join().unwrap(), Err(SyncError::Interrupted));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared, clonable cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every wait using this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
