//! Dispatch queues for completion handlers and timers.
//!
//! A [`Queue`] decides where a continuation runs. Serial queues are drained
//! by a single tokio task, so jobs submitted to one queue execute one at a
//! time in submission order while the runtime's worker pool is shared
//! between all queues.

use crate::errors::{FutureError, FutureResult};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// A unit of work submitted to a queue.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
enum QueueKind {
    Inline,
    Serial {
        sender: mpsc::UnboundedSender<Job>,
        handle: Handle,
    },
}

/// A handle to a dispatch queue.
#[derive(Clone)]
pub struct Queue {
    label: Arc<str>,
    kind: QueueKind,
}

impl Queue {
    /// A queue that runs jobs synchronously on the submitting thread.
    #[must_use]
    pub fn inline() -> Self {
        Self {
            label: Arc::from("inline"),
            kind: QueueKind::Inline,
        }
    }

    /// A serial queue on the ambient tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    #[must_use]
    pub fn serial(label: impl Into<String>) -> Self {
        Self::serial_on(label, &Handle::current())
    }

    /// A serial queue whose worker task lives on `handle`.
    #[must_use]
    pub fn serial_on(label: impl Into<String>, handle: &Handle) -> Self {
        let label: Arc<str> = Arc::from(label.into());
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let worker_label = label.clone();
        handle.spawn(async move {
            while let Some(job) = receiver.recv().await {
                run_job(&worker_label, job);
            }
        });
        Self {
            label,
            kind: QueueKind::Serial {
                sender,
                handle: handle.clone(),
            },
        }
    }

    /// The queue's label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns true if jobs run on the submitting thread.
    #[must_use]
    pub const fn is_inline(&self) -> bool {
        matches!(self.kind, QueueKind::Inline)
    }

    /// Submits a job.
    ///
    /// If the serial worker has gone away with its runtime, the job runs
    /// inline rather than being dropped.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        match &self.kind {
            QueueKind::Inline => run_job(&self.label, Box::new(job)),
            QueueKind::Serial { sender, .. } => {
                if let Err(mpsc::error::SendError(job)) = sender.send(Box::new(job)) {
                    warn!(queue = %self.label, "Serial queue worker is gone, running job inline");
                    run_job(&self.label, job);
                }
            }
        }
    }

    /// The runtime used for timers and async bodies.
    pub fn runtime(&self) -> FutureResult<Handle> {
        match &self.kind {
            QueueKind::Serial { handle, .. } => Ok(handle.clone()),
            QueueKind::Inline => Handle::try_current().map_err(|_| FutureError::NoRuntime),
        }
    }

    /// Runs `job` on this queue once `delay` has elapsed.
    ///
    /// Aborting the returned handle prevents the job from being dispatched.
    pub fn dispatch_after(
        &self,
        delay: Duration,
        job: impl FnOnce() + Send + 'static,
    ) -> FutureResult<JoinHandle<()>> {
        let handle = self.runtime()?;
        let queue = self.clone();
        Ok(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            queue.dispatch(job);
        }))
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::inline()
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("label", &self.label)
            .field("inline", &self.is_inline())
            .finish()
    }
}

fn run_job(label: &str, job: Job) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
        warn!(queue = %label, "Queued job panicked: {:?}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_inline_runs_immediately() {
        let queue = Queue::inline();
        let hits = Arc::new(Mutex::new(0));
        let hits_clone = hits.clone();
        queue.dispatch(move || *hits_clone.lock() += 1);
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn test_inline_survives_panic() {
        let queue = Queue::inline();
        queue.dispatch(|| panic!("Intentional"));
        queue.dispatch(|| {});
    }

    #[test]
    fn test_inline_without_runtime() {
        assert!(matches!(Queue::inline().runtime(), Err(FutureError::NoRuntime)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_serial_preserves_order() {
        let queue = Queue::serial("order");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = tokio::sync::oneshot::channel();

        for i in 0..100 {
            let seen = seen.clone();
            queue.dispatch(move || seen.lock().push(i));
        }
        queue.dispatch(move || {
            let _ = tx.send(());
        });

        rx.await.unwrap();
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dispatch_after() {
        let queue = Queue::serial("timer");
        let (tx, rx) = tokio::sync::oneshot::channel();
        let started = std::time::Instant::now();
        queue
            .dispatch_after(Duration::from_millis(20), move || {
                let _ = tx.send(());
            })
            .unwrap();
        rx.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dispatch_after_abort() {
        let queue = Queue::serial("abort");
        let fired = Arc::new(Mutex::new(false));
        let fired_clone = fired.clone();
        let timer = queue
            .dispatch_after(Duration::from_millis(20), move || *fired_clone.lock() = true)
            .unwrap();
        timer.abort();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!*fired.lock());
    }
}
