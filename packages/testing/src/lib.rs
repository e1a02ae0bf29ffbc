#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing and examples in the settlement workspace.

use std::env;
use std::panic;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// Set to "1" by mutation testing, where hanging mutants must be allowed to hang so the
/// mutation tool can detect them.
const MUTATION_TESTING_ENV: &str = "MUTATION_TESTING";

fn watchdog_timeout() -> Duration {
    // Thread synchronization is dramatically slower under Miri.
    if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    }
}

/// Runs a test on a separate thread and fails it if it does not finish in time.
///
/// Multithreaded tests of synchronization primitives tend to deadlock rather than fail when
/// they are broken. The watchdog turns such a hang into a test failure instead of a stuck
/// build. Panics in the test are propagated to the caller unchanged.
///
/// The watchdog is disabled when the `MUTATION_TESTING` environment variable is "1".
///
/// # Panics
///
/// Panics if the test does not finish within the timeout (10 seconds, or 60 under Miri).
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let answer = with_watchdog(|| 6 * 7);
/// assert_eq!(answer, 42);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if env::var(MUTATION_TESTING_ENV).as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_thread = thread::spawn(move || {
        // If this fails, the watchdog has already given up on us.
        drop(tx.send(test_fn()));
    });

    let timeout = watchdog_timeout();

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_thread
                .join()
                .expect("test thread finished sending its result, so it cannot have panicked");
            result
        }
        Err(RecvTimeoutError::Timeout) => {
            panic!("test did not finish within {timeout:?}, assuming it is deadlocked");
        }
        Err(RecvTimeoutError::Disconnected) => match test_thread.join() {
            Ok(()) => panic!("test thread exited without producing a result"),
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

/// Calculates the difference between two f64 values and considers
/// them equal if the difference is not more than `close_enough`.
///
/// Compare the result against `0.0` to assert approximate equality.
#[must_use]
pub fn f64_diff_abs(a: f64, b: f64, close_enough: f64) -> f64 {
    let diff = (a - b).abs();

    if diff <= close_enough { 0.0 } else { diff }
}
