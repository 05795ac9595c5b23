//! Test doubles for shared sessions.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::delta::DeltaSession;
use crate::future::Future;
use crate::operation::{Operation, OperationKind};
use crate::queue::Queue;

/// A shared counter of calls.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    /// Creates a counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one call.
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of calls so far.
    #[must_use]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A session that records its inputs and terminations.
///
/// Its payload is the list of inputs received so far.
#[derive(Debug, Clone)]
pub struct RecordingSession {
    operation: Operation,
    inputs: Arc<Mutex<Vec<String>>>,
    terminations: CallCounter,
}

impl RecordingSession {
    /// A session whose work runs until terminated.
    #[must_use]
    pub fn new() -> Self {
        Self::with_teardown(&Future::empty())
    }

    /// A session whose termination finishes once `stopped` resolves.
    #[must_use]
    pub fn with_teardown(stopped: &Future<()>) -> Self {
        let terminations = CallCounter::new();
        let counter = terminations.clone();
        let stopped = stopped.clone();
        let work: Future<()> = Future::new();
        work.respond_to_cancellation(&Queue::inline(), move || {
            counter.increment();
            stopped
        });
        Self {
            operation: Operation::new(OperationKind::LOG_TAIL, &work),
            inputs: Arc::default(),
            terminations,
        }
    }

    /// A session backed by caller-controlled work.
    #[must_use]
    pub fn with_work(work: &Future<()>) -> Self {
        let terminations = CallCounter::new();
        let counter = terminations.clone();
        work.respond_to_cancellation(&Queue::inline(), move || {
            counter.increment();
            Future::empty()
        });
        Self {
            operation: Operation::new(OperationKind::LOG_TAIL, work),
            inputs: Arc::default(),
            terminations,
        }
    }

    /// Number of times the session's work was cancelled.
    #[must_use]
    pub fn terminations(&self) -> usize {
        self.terminations.get()
    }

    /// Inputs received so far.
    #[must_use]
    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().clone()
    }

    /// Returns true if both handles refer to one session.
    #[must_use]
    pub fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inputs, &other.inputs)
    }
}

impl Default for RecordingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaSession<String, Vec<String>> for RecordingSession {
    fn operation(&self) -> Operation {
        self.operation.clone()
    }

    fn update(&self, input: String) -> Future<()> {
        self.inputs.lock().push(input);
        Future::empty()
    }

    fn snapshot(&self) -> Vec<String> {
        self.inputs()
    }
}
