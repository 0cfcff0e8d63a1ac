//! Writer-preferring reader-writer lock.
//!
//! Any number of readers may hold a [`RwLock`] together; a writer holds it
//! alone. Once a writer starts waiting, newly arriving readers wait behind it,
//! so a steady stream of readers cannot starve writers. Waiting writers are
//! admitted in arrival order.
//!
//! Readers already holding the lock are unaffected by a waiting writer, which
//! means a thread that re-acquires a read lock it already holds while a writer
//! waits will deadlock. Read locks are not reentrant.
//!
//! [`RawRwLock::read_side`] and [`RawRwLock::write_side`] expose the two halves
//! as [`Lockable`] values so they can take part in lock ordering.

use parking_lot::{Condvar, Mutex as ParkingMutex};
use smallvec::SmallVec;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use super::wait::{WaitSpec, wait_until};
use super::{Lockable, current_thread_token, report_dropped_while_held};
use crate::cancel::CancelToken;
use crate::config::{SyncConfig, WaitConfig};
use crate::error::{Result, SyncError};

const READ_LOCK_NAME: &str = "rwlock (read)";
const WRITE_LOCK_NAME: &str = "rwlock (write)";
const LOCK_NAME: &str = "rwlock";

#[derive(Debug, Default)]
struct RwState {
    /// Thread tokens of active readers, one entry per read acquisition.
    readers: SmallVec<[usize; 8]>,
    writer: Option<usize>,
    /// Tickets of waiting writers in arrival order.
    writer_queue: VecDeque<u64>,
    next_ticket: u64,
    waiting_readers: usize,
}

impl RwState {
    fn try_read(&mut self, me: usize) -> bool {
        if self.writer.is_some() || !self.writer_queue.is_empty() {
            return false;
        }
        self.readers.push(me);
        true
    }

    fn try_write_now(&mut self, me: usize) -> bool {
        if self.writer.is_some() || !self.readers.is_empty() || !self.writer_queue.is_empty() {
            return false;
        }
        self.writer = Some(me);
        true
    }

    fn try_write_queued(&mut self, me: usize, ticket: u64) -> bool {
        if self.writer.is_some()
            || !self.readers.is_empty()
            || self.writer_queue.front() != Some(&ticket)
        {
            return false;
        }
        self.writer_queue.pop_front();
        self.writer = Some(me);
        true
    }

    fn abandon_ticket(&mut self, ticket: u64) {
        self.writer_queue.retain(|queued| *queued != ticket);
    }

    fn is_idle(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

/// A reader-writer lock without associated data.
#[derive(Debug)]
pub struct RawRwLock {
    state: ParkingMutex<RwState>,
    condvar: Condvar,
    wait: WaitConfig,
}

impl RawRwLock {
    /// Creates a new unlocked reader-writer lock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&SyncConfig::default())
    }

    /// Creates a new unlocked reader-writer lock tuned by `config`.
    #[must_use]
    pub fn with_config(config: &SyncConfig) -> Self {
        Self {
            state: ParkingMutex::new(RwState::default()),
            condvar: Condvar::new(),
            wait: config.wait.clone(),
        }
    }

    /// Blocks until a shared read lock is held.
    pub fn acquire_read(&self) {
        let acquired = self.read_with(&WaitSpec::forever());
        debug_assert!(acquired.is_ok(), "unbounded wait cannot fail");
    }

    /// Takes a read lock if no writer holds or awaits the lock.
    pub fn try_acquire_read(&self) -> bool {
        self.state.lock().try_read(current_thread_token())
    }

    /// Waits up to `timeout` for a read lock.
    pub fn try_acquire_read_for(&self, timeout: Duration) -> Result<()> {
        self.read_with(&WaitSpec::timeout(timeout))
    }

    /// Waits for a read lock until `token` is cancelled.
    pub fn acquire_read_cancellable(&self, token: &CancelToken) -> Result<()> {
        self.read_with(&WaitSpec::cancellable(token, self.wait.cancel_poll_interval))
    }

    /// Releases one read lock held by the calling thread.
    pub fn release_read(&self) -> Result<()> {
        let wake = {
            let me = current_thread_token();
            let mut state = self.state.lock();
            let Some(index) = state.readers.iter().position(|reader| *reader == me) else {
                return Err(SyncError::NotOwner {
                    lock: READ_LOCK_NAME,
                });
            };
            state.readers.swap_remove(index);
            state.readers.is_empty() && !state.writer_queue.is_empty()
        };
        if wake {
            self.condvar.notify_all();
        }
        Ok(())
    }

    /// Blocks until the exclusive write lock is held.
    pub fn acquire_write(&self) {
        let acquired = self.write_with(&WaitSpec::forever());
        debug_assert!(acquired.is_ok(), "unbounded wait cannot fail");
    }

    /// Takes the write lock if the lock is idle and no writer is queued.
    pub fn try_acquire_write(&self) -> bool {
        self.state.lock().try_write_now(current_thread_token())
    }

    /// Waits up to `timeout` for the write lock.
    pub fn try_acquire_write_for(&self, timeout: Duration) -> Result<()> {
        self.write_with(&WaitSpec::timeout(timeout))
    }

    /// Waits for the write lock until `token` is cancelled.
    pub fn acquire_write_cancellable(&self, token: &CancelToken) -> Result<()> {
        self.write_with(&WaitSpec::cancellable(token, self.wait.cancel_poll_interval))
    }

    /// Releases the write lock held by the calling thread.
    pub fn release_write(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.writer != Some(current_thread_token()) {
                return Err(SyncError::NotOwner {
                    lock: WRITE_LOCK_NAME,
                });
            }
            state.writer = None;
        }
        // Queued writers and parked readers may both proceed; let them race
        // through the admission checks.
        self.condvar.notify_all();
        Ok(())
    }

    /// Returns the number of active read acquisitions.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }

    /// Returns true if a writer holds the lock.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    /// Returns the number of writers waiting for the lock.
    #[must_use]
    pub fn writers_waiting(&self) -> usize {
        self.state.lock().writer_queue.len()
    }

    /// Returns the number of readers parked behind a writer.
    #[must_use]
    pub fn readers_waiting(&self) -> usize {
        self.state.lock().waiting_readers
    }

    /// Returns true if either side of the lock is held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        !self.state.lock().is_idle()
    }

    /// Returns the read half as a [`Lockable`].
    #[must_use]
    pub fn read_side(&self) -> ReadSide<'_> {
        ReadSide { lock: self }
    }

    /// Returns the write half as a [`Lockable`].
    #[must_use]
    pub fn write_side(&self) -> WriteSide<'_> {
        WriteSide { lock: self }
    }

    fn read_with(&self, spec: &WaitSpec<'_>) -> Result<()> {
        let me = current_thread_token();
        let mut state = self.state.lock();
        if state.try_read(me) {
            return Ok(());
        }

        state.waiting_readers += 1;
        let result = wait_until(&self.condvar, &mut state, spec, |state| state.try_read(me));
        state.waiting_readers -= 1;
        result
    }

    fn write_with(&self, spec: &WaitSpec<'_>) -> Result<()> {
        let me = current_thread_token();
        let mut state = self.state.lock();
        if state.try_write_now(me) {
            return Ok(());
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.writer_queue.push_back(ticket);

        let result = wait_until(&self.condvar, &mut state, spec, |state| {
            state.try_write_queued(me, ticket)
        });
        if result.is_err() {
            // Readers parked behind this ticket, and the next writer in line,
            // may be able to proceed now.
            state.abandon_ticket(ticket);
            drop(state);
            self.condvar.notify_all();
        }
        result
    }
}

impl Default for RawRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RawRwLock {
    fn drop(&mut self) {
        if !self.state.get_mut().is_idle() {
            report_dropped_while_held(LOCK_NAME);
        }
    }
}

/// The shared half of a [`RawRwLock`].
#[derive(Debug, Clone, Copy)]
pub struct ReadSide<'a> {
    lock: &'a RawRwLock,
}

impl Lockable for ReadSide<'_> {
    fn acquire(&self) {
        self.lock.acquire_read();
    }

    fn try_acquire(&self) -> bool {
        self.lock.try_acquire_read()
    }

    fn try_acquire_for(&self, timeout: Duration) -> Result<()> {
        self.lock.try_acquire_read_for(timeout)
    }

    fn acquire_cancellable(&self, token: &CancelToken) -> Result<()> {
        self.lock.acquire_read_cancellable(token)
    }

    fn release(&self) -> Result<()> {
        self.lock.release_read()
    }

    fn is_locked(&self) -> bool {
        self.lock.reader_count() > 0
    }
}

/// The exclusive half of a [`RawRwLock`].
#[derive(Debug, Clone, Copy)]
pub struct WriteSide<'a> {
    lock: &'a RawRwLock,
}

impl Lockable for WriteSide<'_> {
    fn acquire(&self) {
        self.lock.acquire_write();
    }

    fn try_acquire(&self) -> bool {
        self.lock.try_acquire_write()
    }

    fn try_acquire_for(&self, timeout: Duration) -> Result<()> {
        self.lock.try_acquire_write_for(timeout)
    }

    fn acquire_cancellable(&self, token: &CancelToken) -> Result<()> {
        self.lock.acquire_write_cancellable(token)
    }

    fn release(&self) -> Result<()> {
        self.lock.release_write()
    }

    fn is_locked(&self) -> bool {
        self.lock.is_write_locked()
    }
}

/// A reader-writer lock protecting a value of type `T`.
#[derive(Debug)]
pub struct RwLock<T> {
    raw: RawRwLock,
    data: UnsafeCell<T>,
}

// Safety: readers share `&T` across threads, writers get exclusive `&mut T`.
#[allow(unsafe_code)]
unsafe impl<T: Send> Send for RwLock<T> {}
#[allow(unsafe_code)]
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new unlocked reader-writer lock.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self::with_config(value, &SyncConfig::default())
    }

    /// Creates a new unlocked reader-writer lock tuned by `config`.
    #[must_use]
    pub fn with_config(value: T, config: &SyncConfig) -> Self {
        Self {
            raw: RawRwLock::with_config(config),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires shared read access, blocking while a writer holds or awaits
    /// the lock.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.raw.acquire_read();
        RwLockReadGuard::new(self)
    }

    /// Acquires read access if that is possible without waiting.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        self.raw
            .try_acquire_read()
            .then(|| RwLockReadGuard::new(self))
    }

    /// Acquires read access, giving up with `Timeout` after `timeout`.
    pub fn try_read_for(&self, timeout: Duration) -> Result<RwLockReadGuard<'_, T>> {
        self.raw.try_acquire_read_for(timeout)?;
        Ok(RwLockReadGuard::new(self))
    }

    /// Acquires read access, giving up with `Interrupted` once `token` is
    /// cancelled.
    pub fn read_cancellable(&self, token: &CancelToken) -> Result<RwLockReadGuard<'_, T>> {
        self.raw.acquire_read_cancellable(token)?;
        Ok(RwLockReadGuard::new(self))
    }

    /// Acquires exclusive write access, blocking until all readers and any
    /// earlier writers are done.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.raw.acquire_write();
        RwLockWriteGuard::new(self)
    }

    /// Acquires write access if that is possible without waiting.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.raw
            .try_acquire_write()
            .then(|| RwLockWriteGuard::new(self))
    }

    /// Acquires write access, giving up with `Timeout` after `timeout`.
    pub fn try_write_for(&self, timeout: Duration) -> Result<RwLockWriteGuard<'_, T>> {
        self.raw.try_acquire_write_for(timeout)?;
        Ok(RwLockWriteGuard::new(self))
    }

    /// Acquires write access, giving up with `Interrupted` once `token` is
    /// cancelled.
    pub fn write_cancellable(&self, token: &CancelToken) -> Result<RwLockWriteGuard<'_, T>> {
        self.raw.acquire_write_cancellable(token)?;
        Ok(RwLockWriteGuard::new(self))
    }

    /// Returns the number of active readers.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.raw.reader_count()
    }

    /// Returns true if a writer holds the lock.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.raw.is_write_locked()
    }

    /// Returns the number of writers waiting for the lock.
    #[must_use]
    pub fn writers_waiting(&self) -> usize {
        self.raw.writers_waiting()
    }

    /// Returns the number of readers parked behind a writer.
    #[must_use]
    pub fn readers_waiting(&self) -> usize {
        self.raw.readers_waiting()
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

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Shared read access to a [`RwLock`], released on drop.
#[must_use = "guard will be immediately released if not held"]
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> RwLockReadGuard<'a, T> {
    fn new(lock: &'a RwLock<T>) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    #[allow(unsafe_code)]
    fn deref(&self) -> &T {
        // Safety: no writer exists while a read guard is alive.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RwLockReadGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLockReadGuard")
            .field("data", &**self)
            .finish()
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        let released = self.lock.raw.release_read();
        debug_assert!(released.is_ok(), "read guard released by its owner");
    }
}

/// Exclusive write access to a [`RwLock`], released on drop.
#[must_use = "guard will be immediately released if not held"]
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> RwLockWriteGuard<'a, T> {
    fn new(lock: &'a RwLock<T>) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    #[allow(unsafe_code)]
    fn deref(&self) -> &T {
        // Safety: the write guard is the only accessor.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    #[allow(unsafe_code)]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the write guard is the only accessor.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RwLockWriteGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLockWriteGuard")
            .field("data", &**self)
            .finish()
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        let released = self.lock.raw.release_write();
        debug_assert!(released.is_ok(), "write guard released by its owner");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn init_test(test_name: &str) {
        init_test_logging();
        crate::test_phase!(test_name);
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        while !condition() {
            std::thread::yield_now();
        }
    }

    #[test]
    fn test_multiple_readers_share() {
        init_test("test_multiple_readers_share");
        let lock = RwLock::new(5);
        let first = lock.read();
        let second = lock.read();
        let readers = lock.reader_count();
        crate::assert_with_log!(readers == 2, "two readers", 2usize, readers);
        let sum = *first + *second;
        crate::assert_with_log!(sum == 10, "both see value", 10, sum);

        let blocked = lock.try_write().is_none();
        crate::assert_with_log!(blocked, "writer excluded by readers", true, blocked);
        drop((first, second));

        let writable = lock.try_write().is_some();
        crate::assert_with_log!(writable, "writer admitted when idle", true, writable);
        crate::test_complete!("test_multiple_readers_share");
    }

    #[test]
    fn test_writer_excludes_readers() {
        init_test("test_writer_excludes_readers");
        let lock = RwLock::new(0);
        let mut guard = lock.write();
        *guard = 9;

        let no_read = lock.try_read().is_none();
        crate::assert_with_log!(no_read, "reader excluded by writer", true, no_read);
        let no_write = lock.try_write().is_none();
        crate::assert_with_log!(no_write, "second writer excluded", true, no_write);
        drop(guard);

        let value = *lock.read();
        crate::assert_with_log!(value == 9, "reader sees write", 9, value);
        crate::test_complete!("test_writer_excludes_readers");
    }

    #[test]
    fn test_waiting_writer_blocks_new_readers() {
        init_test("test_waiting_writer_blocks_new_readers");
        let lock = Arc::new(RwLock::new(Vec::new()));
        let reader = lock.read();

        let writer = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || lock.write().push("writer"))
        };
        wait_for(|| lock.writers_waiting() == 1);

        // A waiting writer turns new readers away, even though only readers
        // currently hold the lock.
        let refused = lock.try_read().is_none();
        crate::assert_with_log!(refused, "new reader refused", true, refused);

        let late_reader = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || lock.read().clone())
        };
        wait_for(|| lock.readers_waiting() == 1);

        drop(reader);
        writer.join().expect("writer join");
        let seen = late_reader.join().expect("reader join");
        crate::assert_with_log!(
            seen == vec!["writer"],
            "late reader ran after writer",
            vec!["writer"],
            seen
        );
        crate::test_complete!("test_waiting_writer_blocks_new_readers");
    }

    #[test]
    fn test_writers_admitted_in_arrival_order() {
        init_test("test_writers_admitted_in_arrival_order");
        let lock = Arc::new(RwLock::new(Vec::new()));
        let gate = lock.write();

        let mut writers = Vec::new();
        for id in 0..4 {
            let handle = {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || lock.write().push(id))
            };
            wait_for(|| lock.writers_waiting() == id + 1);
            writers.push(handle);
        }
        drop(gate);
        for handle in writers {
            handle.join().expect("writer join");
        }

        let order = lock.read().clone();
        crate::assert_with_log!(
            order == vec![0, 1, 2, 3],
            "fifo among writers",
            vec![0, 1, 2, 3],
            order
        );
        crate::test_complete!("test_writers_admitted_in_arrival_order");
    }

    #[test]
    fn test_timed_out_writer_unblocks_readers() {
        init_test("test_timed_out_writer_unblocks_readers");
        let lock = Arc::new(RwLock::new(()));
        let reader = lock.read();

        let writer = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || lock.try_write_for(Duration::from_millis(30)).map(|_| ()))
        };
        wait_for(|| lock.writers_waiting() == 1);

        let late_reader = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || drop(lock.read()))
        };

        let result = writer.join().expect("writer join");
        let timed_out = matches!(result, Err(SyncError::Timeout { .. }));
        crate::assert_with_log!(timed_out, "writer timed out", true, timed_out);

        // Abandoning the ticket readmits the parked reader.
        late_reader.join().expect("reader join");
        let queued = lock.writers_waiting();
        crate::assert_with_log!(queued == 0, "ticket removed", 0usize, queued);
        drop(reader);
        let idle = lock.try_write().is_some();
        crate::assert_with_log!(idle, "lock idle afterwards", true, idle);
        crate::test_complete!("test_timed_out_writer_unblocks_readers");
    }

    #[test]
    fn test_cancelled_reader_leaves_no_trace() {
        init_test("test_cancelled_reader_leaves_no_trace");
        let lock = Arc::new(RwLock::new(()));
        let token = CancelToken::new();
        let writer = lock.write();

        let reader = {
            let lock = Arc::clone(&lock);
            let token = token.clone();
            std::thread::spawn(move || lock.read_cancellable(&token).map(|_| ()))
        };
        wait_for(|| lock.readers_waiting() == 1);
        token.cancel();
        let result = reader.join().expect("reader join");
        crate::assert_with_log!(
            result == Err(SyncError::Interrupted),
            "reader interrupted",
            Err::<(), _>(SyncError::Interrupted),
            result
        );
        drop(writer);
        let readers = lock.reader_count();
        crate::assert_with_log!(readers == 0, "no phantom reader", 0usize, readers);
        crate::test_complete!("test_cancelled_reader_leaves_no_trace");
    }

    #[test]
    fn test_release_without_hold_rejected() {
        init_test("test_release_without_hold_rejected");
        let lock = RawRwLock::new();
        let read = lock.release_read();
        crate::assert_with_log!(
            read == Err(SyncError::NotOwner { lock: READ_LOCK_NAME }),
            "read release rejected",
            Err::<(), _>(SyncError::NotOwner { lock: READ_LOCK_NAME }),
            read
        );

        lock.acquire_read();
        let write = lock.release_write();
        crate::assert_with_log!(
            write == Err(SyncError::NotOwner { lock: WRITE_LOCK_NAME }),
            "write release rejected",
            Err::<(), _>(SyncError::NotOwner { lock: WRITE_LOCK_NAME }),
            write
        );
        lock.release_read().expect("reader release");
        crate::test_complete!("test_release_without_hold_rejected");
    }

    #[test]
    fn test_readers_and_writers_stress() {
        init_test("test_readers_and_writers_stress");
        let lock = Arc::new(RwLock::new(0usize));
        let writers_inside = Arc::new(AtomicUsize::new(0));
        let readers_inside = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for id in 0..8 {
            let lock = Arc::clone(&lock);
            let writers_inside = Arc::clone(&writers_inside);
            let readers_inside = Arc::clone(&readers_inside);
            let violations = Arc::clone(&violations);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    if id % 4 == 0 {
                        let mut guard = lock.write();
                        writers_inside.fetch_add(1, Ordering::SeqCst);
                        if readers_inside.load(Ordering::SeqCst) != 0
                            || writers_inside.load(Ordering::SeqCst) != 1
                        {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        *guard += 1;
                        writers_inside.fetch_sub(1, Ordering::SeqCst);
                    } else {
                        let guard = lock.read();
                        readers_inside.fetch_add(1, Ordering::SeqCst);
                        if writers_inside.load(Ordering::SeqCst) != 0 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        let _ = *guard;
                        readers_inside.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().expect("thread join failed");
        }

        let violations = violations.load(Ordering::SeqCst);
        crate::assert_with_log!(violations == 0, "no exclusion violations", 0usize, violations);
        let writes = *lock.read();
        crate::assert_with_log!(writes == 400, "all writes applied", 400usize, writes);
        crate::test_complete!("test_readers_and_writers_stress");
    }
}
