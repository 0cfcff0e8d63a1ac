//! Rank-based lock ordering.
//!
//! Every lock that takes part in ordering is registered with a
//! [`LockOrderingCoordinator`] and receives a [`LockRank`]. A thread may only
//! request a lock whose rank is strictly greater than every rank it already
//! holds. When all threads follow that rule no cycle of waiters can form, so
//! deadlock is impossible.
//!
//! The coordinator checks the rule at runtime, before any waiting starts:
//!
//! - Under [`OrderPolicy::Enforce`] (the default) an out-of-order request fails
//!   with [`SyncError::LockOrderViolation`] and nothing is acquired.
//! - Under [`OrderPolicy::Detect`] the violation is logged and the request is
//!   allowed. The coordinator keeps a wait-for graph of blocked threads and
//!   [`LockOrderingCoordinator::detect_deadlock`] reports any cycle in it.
//!
//! [`LockOrderingCoordinator::acquire_all`] takes a set of locks atomically:
//! either all of them are held on return, or none are.

mod deadlock;
mod ordered;

use parking_lot::Mutex as ParkingMutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::atomic::AtomicCounter;
use crate::config::{BackoffConfig, OrderPolicy, SyncConfig};
use crate::error::{Result, SyncError};
use crate::sync::current_thread_token;
use crate::tracing_compat::{debug, error, trace, warn};

pub use deadlock::{DeadlockReport, WaitEdge};
pub use ordered::{MultiLockGuard, OrderedGuard, OrderedLock, OrderedMutex, OrderedMutexGuard};

/// Position of a lock in the global acquisition order.
///
/// Lower ranks must be acquired before higher ranks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LockRank(u64);

impl LockRank {
    /// Wraps a raw rank value.
    #[must_use]
    pub const fn new(rank: u64) -> Self {
        Self(rank)
    }

    /// Returns the raw rank value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A lock bound to a rank and a coordinator.
///
/// Implemented by [`OrderedLock`] and [`OrderedMutex`]; used by
/// [`LockOrderingCoordinator::acquire_all`].
pub trait RankedLock {
    /// The lock's rank.
    fn rank(&self) -> LockRank;

    /// The coordinator the rank was issued by.
    fn coordinator(&self) -> &LockOrderingCoordinator;

    /// The underlying lock.
    fn lockable(&self) -> &dyn crate::sync::Lockable;
}

/// Per-thread bookkeeping.
#[derive(Debug)]
struct ThreadRecord {
    label: String,
    /// Ranks held, in acquisition order.
    held: SmallVec<[LockRank; 4]>,
    waiting_for: Option<LockRank>,
}

impl ThreadRecord {
    fn for_current_thread() -> Self {
        let thread = std::thread::current();
        let label = thread
            .name()
            .map_or_else(|| format!("{:?}", thread.id()), str::to_owned);
        Self {
            label,
            held: SmallVec::new(),
            waiting_for: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.held.is_empty() && self.waiting_for.is_none()
    }
}

/// Point-in-time view of a coordinator, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorSnapshot {
    /// How violations are handled.
    pub policy: OrderPolicy,
    /// Highest rank issued so far.
    pub highest_rank: u64,
    /// Out-of-order requests seen since creation.
    pub violations: u64,
    /// Deadlock cycles observed since creation.
    pub deadlocks_detected: u64,
    /// Threads currently holding or waiting for ranked locks.
    pub threads: Vec<ThreadSnapshot>,
}

/// One thread's entry in a [`CoordinatorSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadSnapshot {
    /// Thread name, or its id when unnamed.
    pub thread: String,
    /// Ranks held, in acquisition order.
    pub held: Vec<LockRank>,
    /// Rank the thread is blocked on, if any.
    pub waiting_for: Option<LockRank>,
}

/// Issues lock ranks and checks that threads acquire them in order.
#[derive(Debug)]
pub struct LockOrderingCoordinator {
    next_rank: AtomicCounter,
    policy: OrderPolicy,
    backoff: BackoffConfig,
    threads: ParkingMutex<HashMap<usize, ThreadRecord>>,
    violations: AtomicCounter,
    deadlocks_detected: AtomicCounter,
}

impl LockOrderingCoordinator {
    /// Creates a coordinator with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&SyncConfig::default())
    }

    /// Creates a coordinator using the ordering policy and multi-lock backoff
    /// from `config`.
    #[must_use]
    pub fn with_config(config: &SyncConfig) -> Self {
        Self {
            next_rank: AtomicCounter::new(0),
            policy: config.ordering.policy,
            backoff: config.backoff.clone(),
            threads: ParkingMutex::new(HashMap::new()),
            violations: AtomicCounter::new(0),
            deadlocks_detected: AtomicCounter::new(0),
        }
    }

    /// Returns the process-wide coordinator, created on first use with the
    /// default configuration.
    pub fn global() -> &'static Arc<Self> {
        static GLOBAL: OnceLock<Arc<LockOrderingCoordinator>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Self::new()))
    }

    /// Returns how violations are handled.
    #[must_use]
    pub const fn policy(&self) -> OrderPolicy {
        self.policy
    }

    /// Issues the next rank. Ranks increase monotonically from 1.
    pub fn register_lock(&self) -> LockRank {
        LockRank(non_negative(self.next_rank.increment()))
    }

    /// Issues an explicit rank. Later [`register_lock`](Self::register_lock)
    /// calls return ranks above it.
    pub fn register_lock_with_rank(&self, rank: u64) -> LockRank {
        let floor = i64::try_from(rank).unwrap_or(i64::MAX);
        self.next_rank.update(|current| current.max(floor));
        LockRank(rank)
    }

    /// Checks that `requested` may be acquired while holding `held`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::LockOrderViolation`] unless `requested` is strictly
    /// greater than every rank in `held`.
    pub fn check_order(held: &[LockRank], requested: LockRank) -> Result<()> {
        match held.iter().max() {
            Some(&highest) if requested <= highest => Err(SyncError::LockOrderViolation {
                held: highest,
                requested,
            }),
            _ => Ok(()),
        }
    }

    /// Returns the ranks the calling thread holds, in acquisition order.
    #[must_use]
    pub fn held_ranks(&self) -> Vec<LockRank> {
        self.threads
            .lock()
            .get(&current_thread_token())
            .map(|record| record.held.to_vec())
            .unwrap_or_default()
    }

    /// Searches the wait-for graph for a cycle of blocked threads.
    ///
    /// Under [`OrderPolicy::Enforce`] no cycle can form among ranked locks, so
    /// this only finds something when violations are being allowed.
    pub fn detect_deadlock(&self) -> Option<DeadlockReport> {
        let report = deadlock::find_cycle(&self.threads.lock())?;
        self.deadlocks_detected.increment();
        error!(report = %report, "lock ordering deadlock detected");
        Some(report)
    }

    /// Captures the coordinator's counters and per-thread state.
    #[must_use]
    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let threads = self.threads.lock();
        let mut entries: Vec<ThreadSnapshot> = threads
            .values()
            .map(|record| ThreadSnapshot {
                thread: record.label.clone(),
                held: record.held.to_vec(),
                waiting_for: record.waiting_for,
            })
            .collect();
        entries.sort_by(|a, b| a.thread.cmp(&b.thread));
        CoordinatorSnapshot {
            policy: self.policy,
            highest_rank: non_negative(self.next_rank.get()),
            violations: non_negative(self.violations.get()),
            deadlocks_detected: non_negative(self.deadlocks_detected.get()),
            threads: entries,
        }
    }

    /// Acquires every lock in `locks`, or none of them.
    ///
    /// Locks are taken in ascending rank order regardless of the order given.
    /// Each attempt tries every lock without blocking; if any is busy, the
    /// locks taken so far are released in reverse order and the attempt is
    /// retried after exponential backoff. The calling thread therefore never
    /// holds a strict subset of `locks` while waiting.
    ///
    /// # Errors
    ///
    /// - [`SyncError::LockOrderViolation`] if two locks share a rank, or the
    ///   lowest rank is not above the ranks the thread already holds (under
    ///   [`OrderPolicy::Enforce`]).
    /// - [`SyncError::Timeout`] once the configured `max_attempts` is spent.
    ///
    /// # Panics
    ///
    /// Panics if a lock was ranked by a different coordinator.
    pub fn acquire_all<'a>(&self, locks: &[&'a dyn RankedLock]) -> Result<MultiLockGuard<'a>> {
        self.acquire_set(locks, None)
    }

    /// Like [`acquire_all`](Self::acquire_all), giving up with
    /// [`SyncError::Timeout`] after `timeout`.
    ///
    /// # Errors
    ///
    /// As for [`acquire_all`](Self::acquire_all).
    ///
    /// # Panics
    ///
    /// Panics if a lock was ranked by a different coordinator.
    pub fn acquire_all_for<'a>(
        &self,
        locks: &[&'a dyn RankedLock],
        timeout: Duration,
    ) -> Result<MultiLockGuard<'a>> {
        self.acquire_set(locks, Some(timeout))
    }

    fn acquire_set<'a>(
        &self,
        locks: &[&'a dyn RankedLock],
        timeout: Option<Duration>,
    ) -> Result<MultiLockGuard<'a>> {
        let mut ordered: SmallVec<[&'a dyn RankedLock; 4]> = locks.iter().copied().collect();
        for lock in &ordered {
            assert!(
                std::ptr::eq(lock.coordinator(), self),
                "lock rank {} belongs to a different coordinator",
                lock.rank()
            );
        }
        ordered.sort_by_key(|lock| lock.rank());
        if let Some(pair) = ordered.windows(2).find(|pair| pair[0].rank() == pair[1].rank()) {
            let rank = pair[0].rank();
            self.violations.increment();
            warn!(rank = %rank, "duplicate rank in multi-lock request");
            return Err(SyncError::LockOrderViolation {
                held: rank,
                requested: rank,
            });
        }
        if let Some(lowest) = ordered.first() {
            self.admit(lowest.rank())?;
        }

        let start = Instant::now();
        let deadline = timeout.map(|timeout| start + timeout);
        let mut attempt: u32 = 0;
        loop {
            if self.try_take_all(&ordered) {
                return Ok(MultiLockGuard::new(ordered));
            }
            attempt = attempt.saturating_add(1);

            let now = Instant::now();
            let attempts_spent = self
                .backoff
                .max_attempts
                .is_some_and(|max| attempt >= max);
            let past_deadline = deadline.is_some_and(|deadline| now >= deadline);
            if attempts_spent || past_deadline {
                debug!(attempt, locks = ordered.len(), "multi-lock acquisition gave up");
                return Err(SyncError::Timeout {
                    waited: timeout.unwrap_or_else(|| now - start),
                });
            }

            let mut delay = self.backoff.delay_for(attempt);
            if let Some(deadline) = deadline {
                delay = delay.min(deadline - now);
            }
            trace!(attempt, delay = ?delay, "multi-lock attempt failed, backing off");
            std::thread::sleep(delay);
        }
    }

    /// One all-or-nothing pass over `ordered`.
    fn try_take_all(&self, ordered: &[&dyn RankedLock]) -> bool {
        for (taken, lock) in ordered.iter().enumerate() {
            if lock.lockable().try_acquire() {
                self.on_acquired(lock.rank());
                continue;
            }
            for held in ordered[..taken].iter().rev() {
                let released = held.lockable().release();
                debug_assert!(released.is_ok(), "multi-lock releases its own locks");
                self.on_released(held.rank());
            }
            return false;
        }
        true
    }

    /// Applies the ordering policy to a request for `rank` by the calling
    /// thread.
    fn admit(&self, rank: LockRank) -> Result<()> {
        let me = current_thread_token();
        let threads = self.threads.lock();
        let held = threads.get(&me).map_or(&[][..], |record| &record.held[..]);
        let Err(violation) = Self::check_order(held, rank) else {
            return Ok(());
        };
        self.violations.increment();
        match self.policy {
            OrderPolicy::Enforce => {
                warn!(error = %violation, "lock order violation rejected");
                Err(violation)
            }
            OrderPolicy::Detect => {
                warn!(error = %violation, "lock order violation allowed for detection");
                Ok(())
            }
        }
    }

    /// Called before a potentially blocking acquisition of `rank`.
    #[cfg_attr(not(feature = "tracing-integration"), allow(unused_variables))]
    pub(crate) fn before_acquire(&self, rank: LockRank) -> Result<()> {
        self.admit(rank)?;
        let mut threads = self.threads.lock();
        threads
            .entry(current_thread_token())
            .or_insert_with(ThreadRecord::for_current_thread)
            .waiting_for = Some(rank);
        if self.policy == OrderPolicy::Detect {
            if let Some(report) = deadlock::find_cycle(&threads) {
                self.deadlocks_detected.increment();
                error!(report = %report, "lock ordering deadlock detected");
            }
        }
        Ok(())
    }

    /// Called once `rank` is held by the calling thread.
    pub(crate) fn on_acquired(&self, rank: LockRank) {
        let mut threads = self.threads.lock();
        let record = threads
            .entry(current_thread_token())
            .or_insert_with(ThreadRecord::for_current_thread);
        record.waiting_for = None;
        record.held.push(rank);
    }

    /// Called when a wait announced by `before_acquire` gave up.
    pub(crate) fn on_abandoned(&self, rank: LockRank) {
        self.update_record(|record| {
            if record.waiting_for == Some(rank) {
                record.waiting_for = None;
            }
        });
    }

    /// Called after the calling thread released `rank`.
    pub(crate) fn on_released(&self, rank: LockRank) {
        self.update_record(|record| {
            if let Some(index) = record.held.iter().rposition(|held| *held == rank) {
                record.held.remove(index);
            }
        });
    }

    fn update_record(&self, f: impl FnOnce(&mut ThreadRecord)) {
        let me = current_thread_token();
        let mut threads = self.threads.lock();
        if let Some(record) = threads.get_mut(&me) {
            f(record);
            if record.is_idle() {
                threads.remove(&me);
            }
        }
    }
}

impl Default for LockOrderingCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::cast_sign_loss)]
const fn non_negative(value: i64) -> u64 {
    if value < 0 { 0 } else { value as u64 }
}
