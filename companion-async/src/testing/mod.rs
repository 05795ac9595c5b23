//! Testing utilities for futures, contexts and shared sessions.
//!
//! This module provides:
//! - A recording [`DeltaSession`](crate::delta::DeltaSession) double
//! - Call counters for starters and teardowns
//! - Assertions on terminal future states
//! - Tracing setup for tests

mod assertions;
mod mocks;

pub use assertions::{
    assert_cancelled, assert_failed_with, assert_pending, assert_resolved,
};
pub use mocks::{CallCounter, RecordingSession};

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a test subscriber honouring `RUST_LOG`, once per process.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}
