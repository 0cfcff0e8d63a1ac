//! Error types and error handling strategy for Lockstep.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Waiting failures (`Timeout`, `Interrupted`) are ordinary results
//! - Usage failures (`NotOwner`, `PermitOverflow`, `LockOrderViolation`) are
//!   programmer errors and must not be retried or swallowed
//!
//! # Recovery Classification
//!
//! All errors can be classified by [`Recoverability`]:
//! - `Transient`: the wait did not succeed this time, retrying is meaningful
//! - `Permanent`: a design bug or bad configuration, retrying cannot help

use std::time::Duration;

use crate::config::ConfigError;
use crate::order::LockRank;

/// Convenience alias used throughout the crate.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Errors reported by the synchronization primitives.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    /// A thread released a lock it does not own.
    #[error("{lock} released by a thread that does not own it")]
    NotOwner {
        /// Which primitive rejected the release.
        lock: &'static str,
    },
    /// A semaphore was released more times than it has permits.
    #[error("semaphore released beyond its {max_permits} permits")]
    PermitOverflow {
        /// The semaphore's configured maximum.
        max_permits: usize,
    },
    /// A timed acquisition did not complete before its deadline.
    #[error("acquisition timed out after {waited:?}")]
    Timeout {
        /// How long the caller was willing to wait.
        waited: Duration,
    },
    /// A lock was requested out of rank order.
    #[error("lock order violation: requested rank {requested} while holding rank {held}")]
    LockOrderViolation {
        /// The highest rank the thread already holds.
        held: LockRank,
        /// The rank that was requested.
        requested: LockRank,
    },
    /// A blocking wait was cancelled through its [`CancelToken`](crate::CancelToken).
    #[error("wait interrupted by cancellation")]
    Interrupted,
    /// Configuration could not be loaded or failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The kind of error, without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Release by a non-owner.
    NotOwner,
    /// Semaphore released beyond its maximum.
    PermitOverflow,
    /// Timed acquisition expired.
    Timeout,
    /// Out-of-order lock acquisition.
    LockOrderViolation,
    /// Wait cancelled externally.
    Interrupted,
    /// Invalid configuration.
    Config,
}

impl ErrorKind {
    /// Returns the recoverability classification for this error kind.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        match self {
            Self::Timeout | Self::Interrupted => Recoverability::Transient,
            Self::NotOwner | Self::PermitOverflow | Self::LockOrderViolation | Self::Config => {
                Recoverability::Permanent
            }
        }
    }

    /// Returns true if retrying the operation is meaningful.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.recoverability().should_retry()
    }

    /// Returns true if this error indicates a bug in the calling code.
    ///
    /// Masking these turns a detectable bug into a live deadlock or a
    /// corrupted invariant, so callers should surface them loudly.
    #[must_use]
    pub const fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::NotOwner | Self::PermitOverflow | Self::LockOrderViolation
        )
    }
}

/// Classification of error recoverability for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recoverability {
    /// The operation may succeed if attempted again.
    Transient,
    /// The operation will not succeed if attempted again.
    Permanent,
}

impl Recoverability {
    /// Returns true if this error is safe to retry.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Returns true if this error should never be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent)
    }
}

impl SyncError {
    /// Returns the payload-free kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotOwner { .. } => ErrorKind::NotOwner,
            Self::PermitOverflow { .. } => ErrorKind::PermitOverflow,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::LockOrderViolation { .. } => ErrorKind::LockOrderViolation,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Returns true if retrying the operation is meaningful.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Returns true if this error indicates a bug in the calling code.
    #[must_use]
    pub const fn is_programmer_error(&self) -> bool {
        self.kind().is_programmer_error()
    }
}

/// Extension for results that should fail hard on programmer errors.
///
/// ```
/// use lockstep::{RawMutex, Lockable};
/// use lockstep::error::Escalate;
///
/// let mutex = RawMutex::new();
/// mutex.acquire();
/// // Recoverable errors pass through; NotOwner would panic here.
/// mutex.release().escalate().unwrap();
/// ```
pub trait Escalate<T> {
    /// Panics if the error is a programmer error, otherwise returns `self`.
    fn escalate(self) -> Result<T>;
}

impl<T> Escalate<T> for Result<T> {
    #[track_caller]
    fn escalate(self) -> Result<T> {
        match self {
            Err(err) if err.is_programmer_error() => {
                crate::tracing_compat::error!(error = %err, "escalating programmer error");
                panic!("{err}");
            }
            other => other,
        }
    }
}
