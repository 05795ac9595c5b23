//! The single-result future with cooperative cancellation.
//!
//! A [`Future`] is a shared, set-once result cell. Whoever creates it may
//! resolve, fail or cancel it; every other holder observes the same terminal
//! result through completion handlers, which fire exactly once each, in
//! registration order, on the queue they were registered with.
//!
//! Cancellation is cooperative. Cancelling a pending future moves it to the
//! cancelled state immediately and then invokes its cancellation responders,
//! which ask the underlying work to stop. The [`Future::cancel`] call returns
//! a drain future that resolves once every responder has finished.
//!
//! Ownership runs downstream only. A pending future owns its handlers, and
//! through them the futures derived from it; derived futures reach their
//! parents through [`WeakFuture`] handles when propagating cancellation.
//! Handlers and responders are dropped once the future is terminal.

use crate::errors::{FutureError, FutureResult};
use crate::queue::Queue;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::IntoFuture;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

/// A completion handler, invoked once with the terminal result.
pub type Handler<T> = Box<dyn FnOnce(FutureResult<T>) + Send + 'static>;

/// A cancellation responder, returning a future that resolves once the
/// work it stops has wound down.
pub type Responder = Box<dyn FnOnce() -> Future<()> + Send + 'static>;

/// The observable state of a future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FutureState {
    /// The future has not resolved yet.
    Running,
    /// The future resolved with a value.
    Done,
    /// The future resolved with an error.
    Failed,
    /// The future was cancelled.
    Cancelled,
}

impl FutureState {
    /// Derives the state of a terminal result.
    #[must_use]
    pub const fn of<T>(result: &FutureResult<T>) -> Self {
        match result {
            Ok(_) => Self::Done,
            Err(FutureError::Cancelled) => Self::Cancelled,
            Err(_) => Self::Failed,
        }
    }

    /// Returns true for any state other than [`FutureState::Running`].
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for FutureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

struct Cell<T> {
    result: Option<FutureResult<T>>,
    handlers: Vec<(Queue, Handler<T>)>,
    responders: Vec<(Queue, Responder)>,
    /// Set while some thread is dispatching handlers.
    firing: bool,
    /// The drain future of the first cancellation.
    drain: Option<Future<()>>,
}

struct Inner<T> {
    name: RwLock<Option<String>>,
    cell: Mutex<Cell<T>>,
}

/// A handle to an asynchronously produced value.
///
/// Cloning the handle shares the underlying cell.
pub struct Future<T> {
    inner: Arc<Inner<T>>,
}

/// A non-owning handle to a [`Future`].
pub struct WeakFuture<T> {
    inner: Weak<Inner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Clone for WeakFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WeakFuture<T> {
    /// Recovers the future if any strong handle is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Future<T>> {
        self.inner.upgrade().map(|inner| Future { inner })
    }
}

impl<T> Future<T>
where
    T: Clone + Send + 'static,
{
    /// Creates a pending future.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                name: RwLock::new(None),
                cell: Mutex::new(Cell {
                    result: None,
                    handlers: Vec::new(),
                    responders: Vec::new(),
                    firing: false,
                    drain: None,
                }),
            }),
        }
    }

    /// Creates a pending future that invokes `callback` if it is cancelled.
    #[must_use]
    pub fn with_cancel_callback(callback: impl FnOnce() + Send + 'static) -> Self {
        let future = Self::new();
        future.respond_to_cancellation(&Queue::inline(), move || {
            callback();
            Future::empty()
        });
        future
    }

    /// Creates a future that has already succeeded.
    #[must_use]
    pub fn from_result(value: T) -> Self {
        let future = Self::new();
        future.resolve(value);
        future
    }

    /// Creates a future that has already failed.
    #[must_use]
    pub fn from_error(error: FutureError) -> Self {
        let future = Self::new();
        future.fail(error);
        future
    }

    /// Creates a future that has already been cancelled.
    #[must_use]
    pub fn cancelled() -> Self {
        let future = Self::new();
        future.cancel();
        future
    }

    /// Runs an async body on the queue's runtime and resolves with its output.
    ///
    /// Cancelling the returned future aborts the body at its next await
    /// point. The cancellation drain resolves once the task has stopped.
    pub fn spawn<F>(queue: &Queue, body: F) -> Self
    where
        F: std::future::Future<Output = FutureResult<T>> + Send + 'static,
    {
        let future = Self::new();
        let handle = match queue.runtime() {
            Ok(handle) => handle,
            Err(e) => {
                future.fail(e);
                return future;
            }
        };

        let target = future.clone();
        let task = handle.spawn(async move {
            let result = AssertUnwindSafe(body)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(FutureError::msg(format!("Async body panicked: {panic:?}")))
                });
            target.settle(result);
        });

        future.respond_to_cancellation(&Queue::inline(), move || {
            task.abort();
            let stopped = Future::new();
            let notify = stopped.clone();
            handle.spawn(async move {
                let _ = task.await;
                notify.resolve(());
            });
            stopped
        });
        future
    }

    /// Names the future; named futures log their resolution.
    #[must_use]
    pub fn named(self, name: impl Into<String>) -> Self {
        *self.inner.name.write() = Some(name.into());
        self
    }

    /// The name of the future, if any.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.inner.name.read().clone()
    }

    /// Returns a non-owning handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakFuture<T> {
        WeakFuture {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Returns true if both handles share one cell.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> FutureState {
        self.inner
            .cell
            .lock()
            .result
            .as_ref()
            .map_or(FutureState::Running, FutureState::of)
    }

    /// Returns true once the future is terminal.
    #[must_use]
    pub fn has_completed(&self) -> bool {
        self.inner.cell.lock().result.is_some()
    }

    /// The terminal result, if there is one.
    #[must_use]
    pub fn result(&self) -> Option<FutureResult<T>> {
        self.inner.cell.lock().result.clone()
    }

    /// The value, if the future succeeded.
    #[must_use]
    pub fn value(&self) -> Option<T> {
        self.result().and_then(Result::ok)
    }

    /// The error, if the future failed or was cancelled.
    #[must_use]
    pub fn error(&self) -> Option<FutureError> {
        self.result().and_then(Result::err)
    }

    /// Succeeds the future. Returns false if it was already terminal.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Fails the future. Returns false if it was already terminal.
    ///
    /// Failing with [`FutureError::Cancelled`] is equivalent to [`Future::cancel`].
    pub fn fail(&self, error: FutureError) -> bool {
        self.settle(Err(error))
    }

    /// Moves the future to the terminal state described by `result`.
    pub fn settle(&self, result: FutureResult<T>) -> bool {
        if matches!(result, Err(FutureError::Cancelled)) {
            return self.cancel_if_pending().is_some();
        }

        {
            let mut cell = self.inner.cell.lock();
            if cell.result.is_some() {
                return false;
            }
            cell.result = Some(result);
            cell.firing = true;
            // Responders are only needed while pending; dropping them
            // releases any upstream handles they captured.
            cell.responders.clear();
        }
        self.log_resolution();
        self.fire_handlers();
        true
    }

    /// Mirrors the terminal result of `source` into this future.
    ///
    /// Cancelling this future while `source` is pending cancels `source`.
    pub fn resolve_from(&self, source: &Self) -> &Self {
        let target = self.clone();
        source.on_completion(&Queue::inline(), move |result| {
            target.settle(result);
        });
        self.cancel_upstream_on_cancel(source);
        self
    }

    /// A future that mirrors this one's result. Cancelling the observer
    /// leaves this future untouched.
    pub fn observe(&self) -> Self {
        let observer = Self::new();
        let target = observer.clone();
        self.on_completion(&Queue::inline(), move |result| {
            target.settle(result);
        });
        observer
    }

    /// Registers a responder that cancels `upstream` if it is still alive.
    /// This future's drain then waits for the upstream drain.
    ///
    /// Only a weak handle is kept: a pending future keeps the futures
    /// derived from it alive through its handlers, never the reverse.
    pub(crate) fn cancel_upstream_on_cancel<U>(&self, upstream: &Future<U>)
    where
        U: Clone + Send + 'static,
    {
        let upstream = upstream.downgrade();
        self.respond_to_cancellation(&Queue::inline(), move || {
            upstream
                .upgrade()
                .map_or_else(Future::empty, |upstream| upstream.cancel())
        });
    }

    /// Requests cancellation.
    ///
    /// A pending future becomes cancelled and its responders are invoked.
    /// The returned future resolves once all responders have finished.
    /// Cancelling an already cancelled future returns the same drain; any
    /// other terminal future returns an already resolved one.
    pub fn cancel(&self) -> Future<()> {
        if let Some(drain) = self.cancel_if_pending() {
            return drain;
        }
        self.inner
            .cell
            .lock()
            .drain
            .clone()
            .unwrap_or_else(Future::empty)
    }

    fn cancel_if_pending(&self) -> Option<Future<()>> {
        let (responders, drain) = {
            let mut cell = self.inner.cell.lock();
            if cell.result.is_some() {
                return None;
            }
            let drain = Future::new();
            cell.result = Some(Err(FutureError::Cancelled));
            cell.firing = true;
            cell.drain = Some(drain.clone());
            (std::mem::take(&mut cell.responders), drain)
        };
        self.log_resolution();

        let remaining = Arc::new(AtomicUsize::new(responders.len()));
        if responders.is_empty() {
            drain.resolve(());
        }
        for (queue, responder) in responders {
            let remaining = remaining.clone();
            let drain = drain.clone();
            invoke_responder(&queue, responder).on_completion(&Queue::inline(), move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    drain.resolve(());
                }
            });
        }

        self.fire_handlers();
        Some(drain)
    }

    /// Registers a handler for the terminal result.
    ///
    /// Fires immediately (on `queue`) if the future is already terminal.
    pub fn on_completion(
        &self,
        queue: &Queue,
        handler: impl FnOnce(FutureResult<T>) + Send + 'static,
    ) -> &Self {
        let fire_now = {
            let mut cell = self.inner.cell.lock();
            cell.handlers.push((queue.clone(), Box::new(handler)));
            if cell.result.is_some() && !cell.firing {
                cell.firing = true;
                true
            } else {
                false
            }
        };
        if fire_now {
            self.fire_handlers();
        }
        self
    }

    /// Registers a handler that only fires on success.
    pub fn on_success(&self, queue: &Queue, handler: impl FnOnce(T) + Send + 'static) -> &Self {
        self.on_completion(queue, move |result| {
            if let Ok(value) = result {
                handler(value);
            }
        })
    }

    /// Registers a cancellation responder.
    ///
    /// The responder is invoked on `queue` if the future is cancelled while
    /// pending; it is dropped without being called on any other resolution.
    /// Registering on an already cancelled future invokes it immediately.
    pub fn respond_to_cancellation(
        &self,
        queue: &Queue,
        handler: impl FnOnce() -> Future<()> + Send + 'static,
    ) -> &Self {
        let run_now = {
            let mut cell = self.inner.cell.lock();
            match cell.result {
                None => {
                    cell.responders.push((queue.clone(), Box::new(handler)));
                    return self;
                }
                Some(Err(FutureError::Cancelled)) => true,
                Some(_) => false,
            }
        };
        if run_now {
            invoke_responder(queue, Box::new(handler));
        }
        self
    }

    /// Waits for the terminal result from async code without consuming the handle.
    #[must_use]
    pub fn wait(&self) -> Wait<T> {
        let (sender, receiver) = oneshot::channel();
        self.on_completion(&Queue::inline(), move |result| {
            let _ = sender.send(result);
        });
        Wait { receiver }
    }

    fn fire_handlers(&self) {
        loop {
            let (batch, result) = {
                let mut cell = self.inner.cell.lock();
                let result = match cell.result.clone() {
                    Some(result) if !cell.handlers.is_empty() => result,
                    _ => {
                        cell.firing = false;
                        return;
                    }
                };
                (std::mem::take(&mut cell.handlers), result)
            };
            for (queue, handler) in batch {
                let result = result.clone();
                queue.dispatch(move || handler(result));
            }
        }
    }

    fn log_resolution(&self) {
        if let Some(name) = self.name() {
            debug!(future = %name, state = %self.state(), "Future resolved");
        }
    }
}

impl Future<()> {
    /// A future that has already succeeded with `()`.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_result(())
    }
}

impl<T> Default for Future<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Future<T>
where
    T: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

fn invoke_responder(queue: &Queue, responder: Responder) -> Future<()> {
    let finished = Future::new();
    let target = finished.clone();
    queue.dispatch(move || {
        match std::panic::catch_unwind(AssertUnwindSafe(responder)) {
            Ok(stopped) => {
                target.resolve_from(&stopped);
            }
            Err(e) => {
                tracing::warn!("Cancellation responder panicked: {:?}", e);
                target.resolve(());
            }
        }
    });
    finished
}

/// An awaitable view of a [`Future`]'s terminal result.
#[derive(Debug)]
pub struct Wait<T> {
    receiver: oneshot::Receiver<FutureResult<T>>,
}

impl<T> std::future::Future for Wait<T> {
    type Output = FutureResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(FutureError::Cancelled)))
    }
}

impl<T> IntoFuture for Future<T>
where
    T: Clone + Send + 'static,
{
    type Output = FutureResult<T>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<FutureResult<T>>>>, impl Fn() -> Handler<T>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let make = move || -> Handler<T> {
            let seen = seen_clone.clone();
            Box::new(move |result| seen.lock().push(result))
        };
        (seen, make)
    }

    #[test]
    fn test_new_is_running() {
        let future: Future<u32> = Future::new();
        assert_eq!(future.state(), FutureState::Running);
        assert!(!future.has_completed());
        assert!(future.result().is_none());
    }

    #[test]
    fn test_resolve_once() {
        let future = Future::new();
        assert!(future.resolve(1));
        assert!(!future.resolve(2));
        assert!(!future.fail(FutureError::msg("late")));
        assert!(future.cancel().has_completed());
        assert_eq!(future.state(), FutureState::Done);
        assert_eq!(future.value(), Some(1));
    }

    #[test]
    fn test_fail_then_cancel_is_noop() {
        let future: Future<u32> = Future::new();
        assert!(future.fail(FutureError::msg("boom")));
        future.cancel();
        assert_eq!(future.state(), FutureState::Failed);
    }

    #[test]
    fn test_cancel_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let future: Future<u32> = Future::with_cancel_callback(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        let first = future.cancel();
        let second = future.cancel();
        assert!(first.ptr_eq(&second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(future.state(), FutureState::Cancelled);
        assert!(!future.resolve(3));
    }

    #[test]
    fn test_cancel_callback_not_called_on_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let future = Future::with_cancel_callback(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        future.resolve(1);
        future.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handlers_fire_once_in_order() {
        let future = Future::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            future.on_completion(&Queue::inline(), move |result: FutureResult<u32>| {
                order.lock().push((i, result.unwrap()));
            });
        }
        future.resolve(7);
        future.resolve(8);

        let order_late = order.clone();
        future.on_completion(&Queue::inline(), move |result| {
            order_late.lock().push((3, result.unwrap()));
        });

        assert_eq!(*order.lock(), vec![(0, 7), (1, 7), (2, 7), (3, 7)]);
    }

    #[test]
    fn test_handler_sees_cancellation() {
        let (seen, make) = recorder::<u32>();
        let future = Future::new();
        future.on_completion(&Queue::inline(), make());
        future.cancel();
        future.on_completion(&Queue::inline(), make());
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|r| matches!(r, Err(FutureError::Cancelled))));
    }

    #[test]
    fn test_reentrant_registration() {
        let future = Future::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner_future = future.clone();
        let seen_outer = seen.clone();
        future.on_completion(&Queue::inline(), move |_: FutureResult<u32>| {
            seen_outer.lock().push("outer");
            let seen_inner = seen_outer.clone();
            inner_future.on_completion(&Queue::inline(), move |_| seen_inner.lock().push("inner"));
        });
        future.resolve(1);
        assert_eq!(*seen.lock(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_respond_to_cancellation_after_cancel() {
        let future: Future<u32> = Future::cancelled();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        future.respond_to_cancellation(&Queue::inline(), move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Future::empty()
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drain_waits_for_responders() {
        let future: Future<u32> = Future::new();
        let teardown = Future::new();
        let teardown_clone = teardown.clone();
        future.respond_to_cancellation(&Queue::inline(), move || teardown_clone);

        let drain = future.cancel();
        assert_eq!(future.state(), FutureState::Cancelled);
        assert!(!drain.has_completed());
        teardown.resolve(());
        assert_eq!(drain.state(), FutureState::Done);
    }

    #[test]
    fn test_resolve_from() {
        let source = Future::new();
        let target = Future::new();
        target.resolve_from(&source);
        source.resolve(5u8);
        assert_eq!(target.value(), Some(5));
    }

    #[test]
    fn test_resolve_from_propagates_cancel() {
        let source: Future<u8> = Future::new();
        let target = Future::new();
        target.resolve_from(&source);
        target.cancel();
        assert_eq!(source.state(), FutureState::Cancelled);
    }

    #[test]
    fn test_weak_future() {
        let future: Future<u8> = Future::new();
        let weak = future.downgrade();
        assert!(weak.upgrade().is_some());
        drop(future);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_named() {
        let future: Future<u8> = Future::new().named("boot simulator");
        assert_eq!(future.name().as_deref(), Some("boot simulator"));
    }

    #[tokio::test]
    async fn test_await_value() {
        let future = Future::new();
        let producer = future.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            producer.resolve("installed".to_string());
        });
        assert_eq!(future.await.unwrap(), "installed");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_spawn_resolves() {
        let queue = Queue::serial("spawn");
        let future = Future::spawn(&queue, async { Ok(40 + 2) });
        assert_eq!(future.await.unwrap(), 42);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_spawn_cancel_aborts_body() {
        let queue = Queue::serial("spawn");
        let reached = Arc::new(AtomicUsize::new(0));
        let reached_clone = reached.clone();
        let future: Future<()> = Future::spawn(&queue, async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            reached_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let drain = future.cancel();
        drain.await.unwrap();
        assert_eq!(future.state(), FutureState::Cancelled);
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_spawn_panic_fails() {
        let future: Future<()> = Future::spawn(&Queue::inline(), async { panic!("Intentional") });
        let err = future.await.unwrap_err();
        assert!(err.as_underlying().is_some());
    }

    #[test]
    fn test_spawn_without_runtime() {
        let future: Future<()> = Future::spawn(&Queue::inline(), async { Ok(()) });
        assert!(matches!(future.error(), Some(FutureError::NoRuntime)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_serial_queue_handler_order() {
        let queue = Queue::serial("handlers");
        let future = Future::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let order = order.clone();
            future.on_completion(&queue, move |_: FutureResult<()>| order.lock().push(i));
        }
        future.resolve(());
        let done = Future::new();
        let done_clone = done.clone();
        future.on_completion(&queue, move |_| {
            done_clone.resolve(());
        });
        done.await.unwrap();
        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
    }
}
