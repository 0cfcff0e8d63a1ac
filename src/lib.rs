//! Lockstep: thread synchronization primitives with runtime-checked lock ordering.
//!
//! # Overview
//!
//! Lockstep provides the building blocks for thread-safe shared state on plain
//! OS threads:
//!
//! - [`AtomicCounter`]: lock-free counter driven by compare-and-swap loops
//! - [`Mutex`] / [`ReentrantLock`]: exclusive locks (non-reentrant / reentrant)
//! - [`Semaphore`]: counting permit gate
//! - [`RwLock`]: shared-read / exclusive-write lock with writer preference
//! - [`SpinLock`]: busy-wait lock for very short critical sections
//! - [`LockFreeStack`]: Treiber stack with a versioned head
//! - [`LockOrderingCoordinator`]: rank-based deadlock prevention
//!
//! Every lock comes in two forms: a raw form implementing the [`Lockable`]
//! capability (explicit `acquire`/`release`, owner-checked), and a
//! data-carrying form whose RAII guards release on every exit path.
//!
//! # Error Model
//!
//! Failures surface as [`SyncError`]. `Timeout` and `Interrupted` are ordinary
//! recoverable results. `NotOwner`, `PermitOverflow` and `LockOrderViolation`
//! indicate programmer error; see [`error::Escalate`] for surfacing them loudly.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use lockstep::{LockOrderingCoordinator, OrderedMutex};
//!
//! let coordinator = Arc::new(LockOrderingCoordinator::new());
//! let accounts = OrderedMutex::new(&coordinator, vec![100_i64, 50]);
//! let audit = OrderedMutex::new(&coordinator, Vec::<String>::new());
//!
//! // Ascending rank order is accepted.
//! let mut balances = accounts.lock().unwrap();
//! let mut log = audit.lock().unwrap();
//! balances[0] -= 10;
//! balances[1] += 10;
//! log.push("moved 10".to_string());
//! drop(log);
//! drop(balances);
//!
//! // Descending order fails fast instead of risking a deadlock.
//! let _log = audit.lock().unwrap();
//! assert!(accounts.lock().is_err());
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

pub mod atomic;
pub mod cancel;
pub mod config;
pub mod error;
pub mod order;
pub mod stack;
pub mod sync;
pub mod test_utils;
pub(crate) mod tracing_compat;

pub use atomic::AtomicCounter;
pub use cancel::CancelToken;
pub use config::{ConfigError, ConfigLoader, OrderPolicy, SyncConfig};
pub use error::{ErrorKind, Recoverability, Result, SyncError};
pub use order::{
    CoordinatorSnapshot, DeadlockReport, LockOrderingCoordinator, LockRank, MultiLockGuard,
    OrderedGuard, OrderedLock, OrderedMutex, OrderedMutexGuard, RankedLock, ThreadSnapshot,
    WaitEdge,
};
pub use stack::LockFreeStack;
pub use sync::{
    Lockable, Mutex, MutexGuard, OwnedSemaphorePermit, RawMutex, RawReentrantLock, RawRwLock,
    RawSpinLock, ReadSide, ReentrantLock, ReentrantLockGuard, RwLock, RwLockReadGuard,
    RwLockWriteGuard, Semaphore, SemaphorePermit, SpinLock, SpinLockGuard, WriteSide,
};
