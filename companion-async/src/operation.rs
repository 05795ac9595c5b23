//! Long-running operations with a termination capability.
//!
//! An [`Operation`] wraps the future of some continuous work (a log tail, a
//! video stream) together with a `completed` future that resolves once the
//! work has actually stopped, either naturally or after [`Operation::terminate`].

use crate::errors::{FutureError, FutureResult};
use crate::future::{Future, FutureState};
use crate::queue::Queue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// The kind of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationKind(Cow<'static, str>);

impl OperationKind {
    /// An application launch.
    pub const APPLICATION_LAUNCH: Self = Self(Cow::Borrowed("applaunch"));
    /// An agent launch.
    pub const AGENT_LAUNCH: Self = Self(Cow::Borrowed("agentlaunch"));
    /// A test run.
    pub const TEST_LAUNCH: Self = Self(Cow::Borrowed("testlaunch"));
    /// A log tail.
    pub const LOG_TAIL: Self = Self(Cow::Borrowed("logtail"));
    /// A video stream.
    pub const VIDEO_STREAM: Self = Self(Cow::Borrowed("videostream"));
    /// An event stream.
    pub const EVENT_STREAM: Self = Self(Cow::Borrowed("eventstream"));

    /// Creates a custom kind.
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// The kind as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationKind {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Prepared but not started.
    Created,
    /// The work is in progress.
    Running,
    /// The work finished.
    Completed,
    /// The work was terminated.
    Cancelled,
    /// The work failed.
    Failed,
}

impl OperationState {
    /// Returns true for the absorbing states.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

type Starter = Box<dyn FnOnce() -> Future<()> + Send + 'static>;

/// A handle to long-running work.
///
/// Clones share the same work.
#[derive(Clone)]
pub struct Operation {
    kind: OperationKind,
    work: Future<()>,
    completed: Future<()>,
    starter: Arc<Mutex<Option<Starter>>>,
    /// The caller's own work futures, which `work` only reaches weakly.
    retained: Arc<Mutex<Vec<Box<dyn Any + Send>>>>,
}

impl Operation {
    /// Wraps work that is already running.
    pub fn new<T>(kind: impl Into<OperationKind>, work: &Future<T>) -> Self
    where
        T: Clone + Send + 'static,
    {
        let operation = Self::assemble(kind.into(), work.map_replace(()), None);
        operation.retain(work.clone());
        operation
    }

    /// Runs `body` on `queue` as the operation's work.
    pub fn spawn<F>(kind: impl Into<OperationKind>, queue: &Queue, body: F) -> Self
    where
        F: std::future::Future<Output = FutureResult<()>> + Send + 'static,
    {
        Self::assemble(kind.into(), Future::spawn(queue, body), None)
    }

    /// Prepares an operation whose work is produced by `factory` on
    /// [`Operation::start`].
    pub fn prepare<T>(
        kind: impl Into<OperationKind>,
        factory: impl FnOnce() -> Future<T> + Send + 'static,
    ) -> Self
    where
        T: Clone + Send + 'static,
    {
        let retained: Arc<Mutex<Vec<Box<dyn Any + Send>>>> = Arc::default();
        let keep = retained.clone();
        let starter: Starter = Box::new(move || {
            let produced = factory();
            keep.lock().push(Box::new(produced.clone()));
            produced.map_replace(())
        });
        Self {
            retained,
            ..Self::assemble(kind.into(), Future::new(), Some(starter))
        }
    }

    /// An operation that has already completed.
    pub fn done(kind: impl Into<OperationKind>) -> Self {
        Self::assemble(kind.into(), Future::empty(), None)
    }

    fn assemble(kind: OperationKind, work: Future<()>, starter: Option<Starter>) -> Self {
        let completed = Future::new().named(format!("{kind} completed"));

        let target = completed.clone();
        let cancelled_work = work.downgrade();
        work.on_completion(&Queue::inline(), move |result| match result {
            Err(FutureError::Cancelled) => {
                let drain = cancelled_work
                    .upgrade()
                    .map_or_else(Future::empty, |work| work.cancel());
                drain.on_completion(&Queue::inline(), move |_| {
                    target.cancel();
                });
            }
            other => {
                target.settle(other);
            }
        });
        completed.cancel_upstream_on_cancel(&work);

        Self {
            kind,
            work,
            completed,
            starter: Arc::new(Mutex::new(starter)),
            retained: Arc::default(),
        }
    }

    fn retain<T>(&self, work: Future<T>)
    where
        T: Clone + Send + 'static,
    {
        self.retained.lock().push(Box::new(work));
    }

    /// Starts a prepared operation. Returns false if there was nothing to
    /// start, or the operation was terminated first.
    pub fn start(&self) -> bool {
        let Some(starter) = self.starter.lock().take() else {
            return false;
        };
        if self.work.has_completed() {
            return false;
        }
        debug!(kind = %self.kind, "Starting operation");
        let produced = starter();
        self.work.resolve_from(&produced);
        true
    }

    /// The operation's kind.
    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    /// The same work under a different kind.
    #[must_use]
    pub fn renamed(&self, kind: impl Into<OperationKind>) -> Self {
        Self {
            kind: kind.into(),
            ..self.clone()
        }
    }

    /// Resolves once the work has stopped.
    ///
    /// After termination it resolves cancelled, but only once every
    /// cancellation responder of the work has finished.
    pub fn completed(&self) -> &Future<()> {
        &self.completed
    }

    /// The current state.
    pub fn state(&self) -> OperationState {
        match self.completed.state() {
            FutureState::Done => OperationState::Completed,
            FutureState::Failed => OperationState::Failed,
            FutureState::Cancelled => OperationState::Cancelled,
            FutureState::Running if self.starter.lock().is_some() => OperationState::Created,
            FutureState::Running => OperationState::Running,
        }
    }

    /// Asks the work to stop and returns [`Operation::completed`].
    ///
    /// Terminating a finished operation has no effect.
    pub fn terminate(&self) -> Future<()> {
        if !self.work.has_completed() {
            debug!(kind = %self.kind, "Terminating operation");
        }
        self.work.cancel();
        self.completed.clone()
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}
