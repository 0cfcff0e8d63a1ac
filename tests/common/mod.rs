//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub use lockstep::test_utils::init_test_logging;

/// Installs test logging and marks the start of `name`.
pub fn init_test(name: &str) {
    init_test_logging();
    lockstep::test_phase!(name);
}

/// Spawns `count` threads running `body(index)` and joins them in order.
pub fn run_workers<T, F>(count: usize, body: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize) -> T + Send + Sync + Clone + 'static,
{
    let handles: Vec<JoinHandle<T>> = (0..count)
        .map(|index| {
            let body = body.clone();
            std::thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || body(index))
                .expect("spawn worker")
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().expect("worker panicked"))
        .collect()
}

/// Spins until `condition` holds, failing the test after `limit`.
pub fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached within {limit:?}");
        std::thread::yield_now();
    }
}
