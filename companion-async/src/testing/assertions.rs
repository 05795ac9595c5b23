//! Test assertions for future states.

use crate::future::{Future, FutureState};

/// Asserts that the future succeeded with `expected`.
pub fn assert_resolved<T>(future: &Future<T>, expected: &T)
where
    T: Clone + Send + PartialEq + std::fmt::Debug + 'static,
{
    assert_eq!(
        future.value().as_ref(),
        Some(expected),
        "Expected value {:?}, got state {}",
        expected,
        future.state()
    );
}

/// Asserts that the future failed with an error whose message contains
/// `needle`.
pub fn assert_failed_with<T>(future: &Future<T>, needle: &str)
where
    T: Clone + Send + 'static,
{
    assert_eq!(future.state(), FutureState::Failed, "Expected failure");
    let message = future.error().map(|e| e.to_string()).unwrap_or_default();
    assert!(
        message.contains(needle),
        "Expected error containing '{}', got '{}'",
        needle,
        message
    );
}

/// Asserts that the future was cancelled.
pub fn assert_cancelled<T>(future: &Future<T>)
where
    T: Clone + Send + 'static,
{
    assert_eq!(
        future.state(),
        FutureState::Cancelled,
        "Expected cancellation, got state {}",
        future.state()
    );
}

/// Asserts that the future has not resolved.
pub fn assert_pending<T>(future: &Future<T>)
where
    T: Clone + Send + 'static,
{
    assert_eq!(
        future.state(),
        FutureState::Running,
        "Expected a pending future, got state {}",
        future.state()
    );
}
