//! Sync Primitives Conformance Suite
//!
//! Conformance tests for the public API of every primitive.
//!
//! Test Coverage:
//! - SYNC-001: AtomicCounter exact under contention
//! - SYNC-002: Mutex single owner and owner-checked release
//! - SYNC-003: ReentrantLock hold counting
//! - SYNC-004: Semaphore permit limiting and overflow
//! - SYNC-005: RwLock sharing and writer preference
//! - SYNC-006: SpinLock exclusion
//! - SYNC-007: LockFreeStack LIFO and multiset preservation
//! - SYNC-008: Lock ordering violations
//! - SYNC-009: Opposite-order threads always finish
//! - SYNC-010: Timed-out waiters leave no residue
//! - SYNC-011: Cancellation of blocked waiters
//! - SYNC-012: Configured primitives
//! - SYNC-013: Unsynchronized vs. atomic shared counter
//! - SYNC-014: Escalating programmer errors
//! - SYNC-015: Crossed per-lock acquisition under enforced ordering

#![allow(clippy::significant_drop_tightening)]

#[macro_use]
mod common;

use common::{init_test, run_workers, wait_until};
use lockstep::config::Profile;
use lockstep::error::Escalate;
use lockstep::{
    AtomicCounter, CancelToken, ConfigLoader, LockFreeStack, LockOrderingCoordinator, Lockable,
    Mutex, OrderPolicy, OrderedLock, OrderedMutex, RawMutex, RawReentrantLock, RawSpinLock,
    ReentrantLock, RwLock, Semaphore, SpinLock, SyncError,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

const PATIENCE: Duration = Duration::from_secs(5);

/// SYNC-001: AtomicCounter exact under contention
///
/// Ten threads incrementing a thousand times each end at exactly 10 000.
#[test]
fn sync_001_atomic_counter_exact() {
    init_test("sync_001_atomic_counter_exact");
    let counter = Arc::new(AtomicCounter::new(0));

    let c = Arc::clone(&counter);
    run_workers(10, move |_| {
        for _ in 0..1000 {
            c.increment();
        }
    });

    let total = counter.get();
    lockstep::assert_with_log!(total == 10_000, "exact count", 10_000, total);

    let swapped = counter.compare_and_swap(10_000, 5);
    lockstep::assert_with_log!(swapped, "cas on match", true, swapped);
    let missed = counter.compare_and_swap(10_000, 7);
    lockstep::assert_with_log!(!missed, "cas on mismatch", false, missed);
    let value = counter.get();
    lockstep::assert_with_log!(value == 5, "value after cas", 5, value);
    lockstep::test_complete!("sync_001_atomic_counter_exact", total = total);
}

/// SYNC-002: Mutex single owner and owner-checked release
#[test]
fn sync_002_mutex_single_owner() {
    init_test("sync_002_mutex_single_owner");
    let mutex = Arc::new(Mutex::new(0_usize));
    let inside = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicUsize::new(0));

    let (m, i, o) = (Arc::clone(&mutex), Arc::clone(&inside), Arc::clone(&overlap));
    run_workers(8, move |_| {
        for _ in 0..250 {
            let mut guard = m.lock();
            if i.fetch_add(1, Ordering::SeqCst) != 0 {
                o.fetch_add(1, Ordering::SeqCst);
            }
            *guard += 1;
            i.fetch_sub(1, Ordering::SeqCst);
        }
    });

    let overlaps = overlap.load(Ordering::SeqCst);
    lockstep::assert_with_log!(overlaps == 0, "never two owners", 0usize, overlaps);
    let total = *mutex.lock();
    lockstep::assert_with_log!(total == 2000, "all increments", 2000usize, total);

    lockstep::test_section!("non-owner release");
    let raw = Arc::new(RawMutex::new());
    raw.acquire();
    let other = Arc::clone(&raw);
    let result = std::thread::spawn(move || other.release())
        .join()
        .expect("thread join");
    let not_owner = matches!(result, Err(SyncError::NotOwner { .. }));
    lockstep::assert_with_log!(not_owner, "non-owner rejected", true, not_owner);
    let still_held = raw.is_owned_by_current_thread();
    lockstep::assert_with_log!(still_held, "state unchanged", true, still_held);
    raw.release().expect("owner release");
    lockstep::test_complete!("sync_002_mutex_single_owner");
}

/// SYNC-003: ReentrantLock hold counting
///
/// k acquisitions need k releases; until then other threads stay out.
#[test]
fn sync_003_reentrant_hold_counting() {
    init_test("sync_003_reentrant_hold_counting");
    let lock = Arc::new(RawReentrantLock::new());
    let k = 4;
    for _ in 0..k {
        lock.acquire();
    }

    for remaining in (1..k).rev() {
        lock.release().expect("owner release");
        let other = Arc::clone(&lock);
        let outsider = std::thread::spawn(move || other.try_acquire())
            .join()
            .expect("thread join");
        lockstep::assert_with_log!(!outsider, "still held", remaining, lock.hold_count());
    }

    lock.release().expect("final release");
    let other = Arc::clone(&lock);
    let outsider = std::thread::spawn(move || {
        let taken = other.try_acquire();
        if taken {
            other.release().expect("outsider release");
        }
        taken
    })
    .join()
    .expect("thread join");
    lockstep::assert_with_log!(outsider, "free after k releases", true, outsider);

    lockstep::test_section!("data wrapper");
    let data = ReentrantLock::new(std::cell::Cell::new(1));
    let outer = data.lock();
    let inner = data.lock();
    inner.set(outer.get() + 1);
    let depth = data.hold_count();
    lockstep::assert_with_log!(depth == 2, "nested guards", 2u32, depth);
    drop(inner);
    drop(outer);
    let value = data.into_inner().get();
    lockstep::assert_with_log!(value == 2, "nested write visible", 2, value);
    lockstep::test_complete!("sync_003_reentrant_hold_counting");
}

/// SYNC-004: Semaphore permit limiting and overflow
#[test]
fn sync_004_semaphore_limits() {
    init_test("sync_004_semaphore_limits");
    let sem = Arc::new(Semaphore::new(3));
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (s, i, p) = (Arc::clone(&sem), Arc::clone(&inside), Arc::clone(&peak));
    run_workers(10, move |_| {
        for _ in 0..50 {
            let _permit = s.permit();
            let now = i.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_micros(50));
            i.fetch_sub(1, Ordering::SeqCst);
        }
    });

    let peak = peak.load(Ordering::SeqCst);
    lockstep::assert_with_log!(peak <= 3, "never more than 3 inside", "<= 3", peak);
    let available = sem.available_permits();
    lockstep::assert_with_log!(available == 3, "permits restored", 3usize, available);

    let overflow = sem.release();
    lockstep::assert_with_log!(
        overflow == Err(SyncError::PermitOverflow { max_permits: 3 }),
        "over-release rejected",
        "PermitOverflow",
        overflow
    );
    lockstep::test_complete!("sync_004_semaphore_limits", peak = peak);
}

/// SYNC-005: RwLock sharing and writer preference
#[test]
fn sync_005_rwlock_semantics() {
    init_test("sync_005_rwlock_semantics");
    let lock = Arc::new(RwLock::new(0_u32));

    lockstep::test_section!("concurrent readers");
    let r1 = lock.read();
    let r2 = lock.read();
    let readers = lock.reader_count();
    lockstep::assert_with_log!(readers == 2, "two readers at once", 2usize, readers);

    lockstep::test_section!("writer waits for readers");
    let writer = {
        let lock = Arc::clone(&lock);
        std::thread::spawn(move || *lock.write() += 1)
    };
    wait_until(PATIENCE, || lock.writers_waiting() == 1);
    let write_locked = lock.is_write_locked();
    lockstep::assert_with_log!(!write_locked, "writer blocked by readers", false, write_locked);

    lockstep::test_section!("waiting writer blocks new readers");
    let refused = lock.try_read().is_none();
    lockstep::assert_with_log!(refused, "new reader refused", true, refused);

    drop(r1);
    drop(r2);
    writer.join().expect("writer join");
    let value = *lock.read();
    lockstep::assert_with_log!(value == 1, "write applied", 1u32, value);
    lockstep::test_complete!("sync_005_rwlock_semantics");
}

/// SYNC-006: SpinLock exclusion
#[test]
fn sync_006_spinlock_exclusion() {
    init_test("sync_006_spinlock_exclusion");
    let lock = Arc::new(SpinLock::new(Vec::new()));

    let l = Arc::clone(&lock);
    run_workers(4, move |index| {
        for step in 0..500 {
            l.lock().push((index, step));
        }
    });
    let len = lock.lock().len();
    lockstep::assert_with_log!(len == 2000, "every push recorded", 2000usize, len);

    let raw = Arc::new(RawSpinLock::new());
    raw.lock();
    let other = Arc::clone(&raw);
    let result = std::thread::spawn(move || other.unlock())
        .join()
        .expect("thread join");
    let not_owner = matches!(result, Err(SyncError::NotOwner { .. }));
    lockstep::assert_with_log!(not_owner, "foreign unlock rejected", true, not_owner);
    raw.unlock().expect("owner unlock");
    lockstep::test_complete!("sync_006_spinlock_exclusion");
}

/// SYNC-007: LockFreeStack LIFO and multiset preservation
#[test]
fn sync_007_stack_semantics() {
    init_test("sync_007_stack_semantics");
    let stack = Arc::new(LockFreeStack::new());
    let empty = stack.pop();
    lockstep::assert_with_log!(empty.is_none(), "empty pop", None::<u64>, empty);

    for value in [1, 2, 3] {
        stack.push(value);
    }
    let order: Vec<_> = std::iter::from_fn(|| stack.pop()).collect();
    lockstep::assert_with_log!(order == vec![3, 2, 1], "lifo", vec![3, 2, 1], order);

    lockstep::test_section!("concurrent multiset");
    let s = Arc::clone(&stack);
    let popped = run_workers(8, move |index| {
        let mut taken = Vec::new();
        for i in 0..1000 {
            s.push(index as u64 * 1000 + i);
            if i % 2 == 1 {
                taken.extend(s.pop());
            }
        }
        taken
    });
    let mut seen = HashSet::new();
    for value in popped.into_iter().flatten().chain(std::iter::from_fn(|| stack.pop())) {
        assert!(seen.insert(value), "value {value} observed twice");
    }
    let count = seen.len();
    lockstep::assert_with_log!(count == 8000, "every push popped once", 8000usize, count);
    lockstep::test_complete!("sync_007_stack_semantics");
}

/// SYNC-008: Lock ordering violations
///
/// Holding L1 and requesting L1 is a violation; L1 then L2 succeeds.
#[test]
fn sync_008_lock_ordering() {
    init_test("sync_008_lock_ordering");
    let coordinator = Arc::new(LockOrderingCoordinator::new());
    let l1 = OrderedLock::new(&coordinator, RawMutex::new());
    let l2 = OrderedLock::new(&coordinator, RawMutex::new());

    let g1 = l1.acquire().expect("L1");
    let again = l1.acquire().map(|_| ());
    lockstep::assert_with_log!(
        again
            == Err(SyncError::LockOrderViolation {
                held: l1.rank(),
                requested: l1.rank()
            }),
        "L1 while holding L1",
        "LockOrderViolation",
        again
    );

    let g2 = l2.acquire();
    lockstep::assert_with_log!(g2.is_ok(), "L1 then L2", true, g2.is_ok());
    drop(g2);
    drop(g1);

    let static_check = LockOrderingCoordinator::check_order(&[l2.rank()], l1.rank());
    let rejected = static_check.is_err();
    lockstep::assert_with_log!(rejected, "pure check agrees", true, rejected);
    lockstep::test_complete!("sync_008_lock_ordering");
}

/// SYNC-009: Opposite-order threads always finish
///
/// One thread asks for (A, B), the other for (B, A). With `acquire_all`
/// both complete every round.
#[test]
fn sync_009_opposite_order_threads_finish() {
    init_test("sync_009_opposite_order_threads_finish");
    let coordinator = Arc::new(LockOrderingCoordinator::new());
    let a = Arc::new(OrderedMutex::new(&coordinator, 0_u64));
    let b = Arc::new(OrderedMutex::new(&coordinator, 0_u64));

    let (ca, cb, coord) = (Arc::clone(&a), Arc::clone(&b), Arc::clone(&coordinator));
    run_workers(2, move |index| {
        for _ in 0..300 {
            if index == 0 {
                let (mut x, mut y) = ca.lock_pair(&cb).expect("a then b");
                *x += 1;
                *y += 1;
            } else {
                let set = coord.acquire_all(&[&*cb, &*ca]).expect("b then a");
                drop(set);
                let mut x = ca.lock().expect("a alone");
                *x += 1;
            }
        }
    });

    let totals = (*a.lock().expect("a"), *b.lock().expect("b"));
    lockstep::assert_with_log!(totals == (600, 300), "both finished", (600, 300), totals);
    lockstep::test_complete!("sync_009_opposite_order_threads_finish");
}

/// SYNC-010: Timed-out waiters leave no residue
#[test]
fn sync_010_timeouts_leave_no_residue() {
    init_test("sync_010_timeouts_leave_no_residue");
    let timeout = Duration::from_millis(20);
    let locks: Vec<Arc<dyn Lockable>> = vec![
        Arc::new(RawMutex::new()),
        Arc::new(RawReentrantLock::new()),
        Arc::new(RawSpinLock::new()),
        Arc::new(Semaphore::new(1)),
    ];

    for lock in locks {
        lock.acquire();
        let other = Arc::clone(&lock);
        let result = std::thread::spawn(move || other.try_acquire_for(timeout))
            .join()
            .expect("thread join");
        let timed_out = result == Err(SyncError::Timeout { waited: timeout });
        lockstep::assert_with_log!(timed_out, "timed out", "Timeout", result);
        lock.release().expect("owner release");
        let free = !lock.is_locked();
        lockstep::assert_with_log!(free, "nothing acquired late", true, free);
    }
    lockstep::test_complete!("sync_010_timeouts_leave_no_residue");
}

/// SYNC-011: Cancellation of blocked waiters
#[test]
fn sync_011_cancellation() {
    init_test("sync_011_cancellation");
    let config = Profile::Testing.to_config();
    let mutex = Arc::new(Mutex::with_config((), &config));
    let rw = Arc::new(RwLock::with_config((), &config));
    let token = CancelToken::new();

    let held = mutex.lock();
    let writing = rw.write();

    let waiters = {
        let (mutex, rw, token) = (Arc::clone(&mutex), Arc::clone(&rw), token.clone());
        std::thread::spawn(move || {
            let m = mutex.lock_cancellable(&token).map(|_| ());
            let r = rw.read_cancellable(&token).map(|_| ());
            (m, r)
        })
    };
    wait_until(PATIENCE, || mutex.waiters() == 1);
    token.cancel();
    let (m, r) = waiters.join().expect("waiter join");
    let interrupted = m == Err(SyncError::Interrupted) && r == Err(SyncError::Interrupted);
    lockstep::assert_with_log!(interrupted, "both waits interrupted", "Interrupted", (&m, &r));

    drop(held);
    drop(writing);
    let idle = !mutex.is_locked() && rw.reader_count() == 0 && !rw.is_write_locked();
    lockstep::assert_with_log!(idle, "nothing taken after cancel", true, idle);
    lockstep::test_complete!("sync_011_cancellation");
}

/// SYNC-012: Configured primitives
#[test]
fn sync_012_configured_primitives() {
    init_test("sync_012_configured_primitives");
    let config = ConfigLoader::new()
        .profile(Profile::Testing)
        .override_value("LOCKSTEP_ORDERING_POLICY", "detect")
        .override_value("LOCKSTEP_BACKOFF_MAX_ATTEMPTS", "3")
        .load()
        .expect("load config");
    lockstep::assert_with_log!(
        config.ordering.policy == OrderPolicy::Detect,
        "policy override",
        OrderPolicy::Detect,
        config.ordering.policy
    );

    let coordinator = Arc::new(LockOrderingCoordinator::with_config(&config));
    let low = OrderedLock::new(&coordinator, RawMutex::with_config(&config));
    let high = OrderedLock::new(&coordinator, RawMutex::with_config(&config));

    lockstep::test_section!("detect policy allows out-of-order");
    let g_high = high.acquire().expect("high");
    let g_low = low.acquire();
    lockstep::assert_with_log!(g_low.is_ok(), "allowed under detect", true, g_low.is_ok());
    drop(g_low);
    drop(g_high);

    lockstep::test_section!("bounded multi-lock attempts");
    let blocker = Arc::new(OrderedLock::new(&coordinator, RawMutex::with_config(&config)));
    let (held_tx, held_rx) = std::sync::mpsc::channel();
    let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
    let holder = {
        let blocker = Arc::clone(&blocker);
        std::thread::spawn(move || {
            let _guard = blocker.acquire().expect("blocker");
            held_tx.send(()).expect("signal");
            let _ = done_rx.recv();
        })
    };
    held_rx.recv().expect("blocker held");
    let result = coordinator.acquire_all(&[&low, &*blocker]).map(|_| ());
    let gave_up = matches!(result, Err(SyncError::Timeout { .. }));
    lockstep::assert_with_log!(gave_up, "gave up after max attempts", true, gave_up);
    done_tx.send(()).expect("release blocker");
    holder.join().expect("holder join");

    let snapshot = coordinator.snapshot();
    lockstep::assert_with_log!(
        snapshot.violations >= 1,
        "violation counted",
        ">= 1",
        snapshot.violations
    );
    lockstep::test_complete!("sync_012_configured_primitives");
}

/// A counter whose read-modify-write is split into separate load and store.
///
/// Each step is atomic but the increment as a whole is not, so concurrent
/// increments can be lost.
struct SplitCounter {
    value: std::sync::atomic::AtomicU64,
}

impl SplitCounter {
    fn increment(&self) {
        let current = self.value.load(Ordering::SeqCst);
        std::thread::yield_now();
        self.value.store(current + 1, Ordering::SeqCst);
    }
}

/// SYNC-013: Unsynchronized vs. atomic shared counter
///
/// The split counter may lose updates; the mutex-guarded and CAS counters
/// never do.
#[test]
fn sync_013_shared_counter_comparison() {
    init_test("sync_013_shared_counter_comparison");
    let split = Arc::new(SplitCounter {
        value: std::sync::atomic::AtomicU64::new(0),
    });
    let guarded = Arc::new(Mutex::new(0_u64));
    let atomic = Arc::new(AtomicCounter::new(0));

    let (s, g, a) = (Arc::clone(&split), Arc::clone(&guarded), Arc::clone(&atomic));
    run_workers(4, move |_| {
        for _ in 0..500 {
            s.increment();
            *g.lock() += 1;
            a.increment();
        }
    });

    let lossy = split.value.load(Ordering::SeqCst);
    lockstep::assert_with_log!(lossy <= 2000, "split never overcounts", "<= 2000", lossy);
    let guarded = *guarded.lock();
    lockstep::assert_with_log!(guarded == 2000, "mutex exact", 2000u64, guarded);
    let exact = atomic.get();
    lockstep::assert_with_log!(exact == 2000, "atomic exact", 2000i64, exact);
    lockstep::test_complete!(
        "sync_013_shared_counter_comparison",
        lost = 2000 - lossy,
        guarded = guarded
    );
}

/// SYNC-014: Escalating programmer errors
#[test]
fn sync_014_escalate() {
    init_test("sync_014_escalate");
    let timeout: lockstep::Result<()> = Err(SyncError::Timeout {
        waited: Duration::from_millis(1),
    });
    let passed = timeout.clone().escalate() == timeout;
    lockstep::assert_with_log!(passed, "recoverable passes through", true, passed);

    let panicked = std::panic::catch_unwind(|| {
        let misuse: lockstep::Result<()> = Err(SyncError::PermitOverflow { max_permits: 1 });
        let _ = misuse.escalate();
    })
    .is_err();
    lockstep::assert_with_log!(panicked, "programmer error panics", true, panicked);
    lockstep::test_complete!("sync_014_escalate");
}

/// SYNC-015: Crossed per-lock acquisition under enforced ordering
///
/// One thread takes L1 then L2, the other L2 then L1, each through a plain
/// `acquire` with both first locks held before either asks for its second.
/// The descending request fails fast with `LockOrderViolation` instead of
/// waiting, so both threads finish.
#[test]
fn sync_015_crossed_acquire_rejected_before_waiting() {
    init_test("sync_015_crossed_acquire_rejected_before_waiting");
    let coordinator = Arc::new(LockOrderingCoordinator::new());
    let l1 = Arc::new(OrderedLock::new(&coordinator, RawMutex::new()));
    let l2 = Arc::new(OrderedLock::new(&coordinator, RawMutex::new()));
    let barrier = Arc::new(Barrier::new(2));

    let crossed = |first: &Arc<OrderedLock<RawMutex>>, second: &Arc<OrderedLock<RawMutex>>| {
        let (first, second) = (Arc::clone(first), Arc::clone(second));
        let barrier = Arc::clone(&barrier);
        std::thread::spawn(move || {
            let _first = first.acquire().expect("first lock is in order");
            barrier.wait();
            second.acquire().map(|_| ())
        })
    };
    let ascending = crossed(&l1, &l2);
    let descending = crossed(&l2, &l1);

    let ascending = ascending.join().expect("ascending thread");
    let descending = descending.join().expect("descending thread");
    lockstep::assert_with_log!(ascending.is_ok(), "L1 then L2 proceeds", "Ok", ascending);
    lockstep::assert_with_log!(
        descending
            == Err(SyncError::LockOrderViolation {
                held: l2.rank(),
                requested: l1.rank(),
            }),
        "L2 then L1 rejected",
        "LockOrderViolation",
        descending
    );

    let idle = !l1.inner().is_locked() && !l2.inner().is_locked();
    lockstep::assert_with_log!(idle, "both locks released", true, idle);
    lockstep::test_complete!("sync_015_crossed_acquire_rejected_before_waiting");
}
