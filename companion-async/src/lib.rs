//! # Companion Async
//!
//! Cancellable futures and shared-session plumbing for long-running
//! device work.
//!
//! The crate provides:
//!
//! - **Futures**: single-assignment results with cooperative cancellation
//!   that propagates to the work they derive from
//! - **Combinators**: mapping, chaining, timeouts, races, aggregation and
//!   retry loops
//! - **Contexts**: resources acquired alongside a value and released in
//!   reverse order when the consumer is done
//! - **Context pools**: one lazily prepared context lent to successive
//!   utilizations and torn down once idle
//! - **Operations**: handles to long-running work that can be started,
//!   observed and terminated
//! - **Delta updates**: one shared session per key, reference counted
//!   across clients that push incremental updates
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use companion_async::prelude::*;
//!
//! let queue = Queue::serial("logs");
//! let lines = Future::spawn(&queue, async { Ok(read_lines().await?) })
//!     .timeout(&queue, Duration::from_secs(5), "reading logs")
//!     .map(&queue, |lines| lines.len());
//!
//! // Cancelling the derived future cancels the read.
//! lines.cancel();
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod combinators;
pub mod context;
pub mod context_manager;
pub mod delta;
pub mod errors;
pub mod future;
pub mod operation;
pub mod queue;
pub mod retry;
pub mod sync;
pub mod testing;

pub use errors::{FutureError, FutureResult};
pub use future::{Future, FutureState, WeakFuture};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::combinators::{
        after, collect, collect_settled, race, resolve_or_fail_when, resolve_until,
        resolve_when, retry, LoopState,
    };
    pub use crate::context::{FutureContext, Teardown};
    pub use crate::context_manager::{
        ContextDelegate, ContextManagerConfig, FutureContextManager,
    };
    pub use crate::delta::{
        DeltaManagerConfig, DeltaSession, DeltaUpdateManager, SessionInfo, SessionState,
        StopOutcome,
    };
    pub use crate::errors::{FutureError, FutureResult};
    pub use crate::future::{Future, FutureState, WeakFuture};
    pub use crate::operation::{Operation, OperationKind, OperationState};
    pub use crate::queue::Queue;
    pub use crate::retry::{BackoffStrategy, JitterStrategy, RetryConfig};
}
