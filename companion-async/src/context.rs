//! Resource-scoped futures.
//!
//! A [`FutureContext`] pairs an asynchronously acquired value with a stack of
//! [`Teardown`] actions. Consuming the context with [`FutureContext::pop`]
//! runs a function over the value and then unwinds the stack, innermost
//! teardown first, whatever the function's outcome.
//!
//! Contexts are consumed by value. Every consuming method returns a new
//! context or a plain [`Future`], so a teardown stack has exactly one owner
//! at any time.
//!
//! Cancelling the consumer never cancels an acquisition in flight. The
//! acquisition is allowed to finish and its resource is released
//! immediately, without running the consumer function.

use crate::combinators::collect_settled;
use crate::errors::{FutureError, FutureResult};
use crate::future::{Future, FutureState, WeakFuture};
use crate::queue::Queue;
use parking_lot::Mutex;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// A boxed teardown action.
pub type TeardownAction = Box<dyn FnOnce(FutureState) -> Future<()> + Send + 'static>;

/// A clonable teardown action that runs at most once.
///
/// The action receives the terminal state of whatever consumed the context
/// and returns a future that resolves once the resource is released.
#[derive(Clone)]
pub struct Teardown {
    name: Option<Arc<str>>,
    queue: Queue,
    action: Arc<Mutex<Option<TeardownAction>>>,
}

impl Teardown {
    /// Creates a teardown that runs `action` on `queue`.
    pub fn new(
        queue: &Queue,
        action: impl FnOnce(FutureState) -> Future<()> + Send + 'static,
    ) -> Self {
        Self {
            name: None,
            queue: queue.clone(),
            action: Arc::new(Mutex::new(Some(Box::new(action)))),
        }
    }

    /// Names the teardown for logging.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(Arc::from(name.into()));
        self
    }

    /// The teardown's name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns true once the action has been taken by [`Teardown::run`].
    pub fn has_run(&self) -> bool {
        self.action.lock().is_none()
    }

    /// Runs the action if no clone has run it yet.
    ///
    /// Later calls return an already resolved future. A panicking action
    /// resolves the returned future with an error.
    pub fn run(&self, state: FutureState) -> Future<()> {
        let Some(action) = self.action.lock().take() else {
            return Future::empty();
        };

        let finished = Future::new();
        let target = finished.clone();
        let name = self.name.clone();
        self.queue.dispatch(move || {
            match std::panic::catch_unwind(AssertUnwindSafe(move || action(state))) {
                Ok(released) => {
                    target.resolve_from(&released);
                }
                Err(e) => {
                    warn!(teardown = ?name, "Teardown panicked: {:?}", e);
                    target.fail(FutureError::msg("Teardown panicked"));
                }
            }
        });
        finished
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown")
            .field("name", &self.name)
            .field("queue", &self.queue.label())
            .field("has_run", &self.has_run())
            .finish()
    }
}

/// Unwinds `stack` from the top, one teardown at a time.
///
/// Each teardown starts only after the previous one's future is terminal. A
/// failing teardown is logged and the unwinding continues.
fn unwind(stack: Vec<Teardown>, state: FutureState) -> Future<()> {
    let done = Future::new();
    unwind_into(stack, state, done.clone());
    done
}

fn unwind_into(mut stack: Vec<Teardown>, state: FutureState, done: Future<()>) {
    let Some(top) = stack.pop() else {
        done.resolve(());
        return;
    };
    top.run(state).on_completion(&Queue::inline(), move |result| {
        if let Err(e) = result {
            warn!(teardown = ?top.name(), error = %e, "Teardown failed");
        }
        unwind_into(stack, state, done);
    });
}

fn state_of_error(error: &FutureError) -> FutureState {
    if error.is_cancelled() {
        FutureState::Cancelled
    } else {
        FutureState::Failed
    }
}

fn guarded<U>(f: impl FnOnce() -> Future<U>) -> Future<U>
where
    U: Clone + Send + 'static,
{
    std::panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| {
        warn!("Context function panicked: {:?}", panic);
        Future::from_error(FutureError::msg(format!(
            "Context function panicked: {panic:?}"
        )))
    })
}

#[derive(Clone)]
struct Scoped<T> {
    value: T,
    teardowns: Vec<Teardown>,
}

/// A future value bundled with the teardown of the resources behind it.
pub struct FutureContext<T> {
    inner: Future<Scoped<T>>,
}

impl<T> FutureContext<T>
where
    T: Clone + Send + 'static,
{
    /// Bundles an acquisition with its release.
    ///
    /// `acquire` is invoked immediately; the teardown it yields runs exactly
    /// once after the context is consumed.
    pub fn with_context(acquire: impl FnOnce() -> Future<(T, Teardown)>) -> Self {
        let inner = acquire().map(&Queue::inline(), |(value, teardown)| Scoped {
            value,
            teardowns: vec![teardown],
        });
        Self { inner }
    }

    /// A context with no teardown.
    pub fn from_future(future: &Future<T>) -> Self {
        let inner = future.map(&Queue::inline(), |value| Scoped {
            value,
            teardowns: Vec::new(),
        });
        Self { inner }
    }

    /// A resolved context with no teardown.
    pub fn from_result(value: T) -> Self {
        Self {
            inner: Future::from_result(Scoped {
                value,
                teardowns: Vec::new(),
            }),
        }
    }

    /// A failed context.
    pub fn from_error(error: FutureError) -> Self {
        Self {
            inner: Future::from_error(error),
        }
    }

    /// The state of the acquisition, not of any consumer.
    pub fn state(&self) -> FutureState {
        self.inner.state()
    }

    /// Number of teardowns pending once the acquisition has succeeded.
    pub fn depth(&self) -> Option<usize> {
        self.inner.value().map(|scoped| scoped.teardowns.len())
    }

    /// Transforms the value. The teardown stack is unchanged.
    pub fn map<U>(self, queue: &Queue, f: impl FnOnce(T) -> U + Send + 'static) -> FutureContext<U>
    where
        U: Clone + Send + 'static,
    {
        self.extend(queue, false, move |value| {
            Future::from_result(Scoped {
                value: f(value),
                teardowns: Vec::new(),
            })
        })
    }

    /// Replaces the value with an asynchronously derived one, keeping the
    /// context alive. The teardown still waits for a later `pop`.
    pub fn pend<U>(
        self,
        queue: &Queue,
        f: impl FnOnce(T) -> Future<U> + Send + 'static,
    ) -> FutureContext<U>
    where
        U: Clone + Send + 'static,
    {
        self.extend(queue, false, move |value| {
            f(value).map(&Queue::inline(), |value| Scoped {
                value,
                teardowns: Vec::new(),
            })
        })
    }

    /// Nests another context on top of this one.
    ///
    /// When the combined context is consumed, the pushed context's
    /// teardowns run before this context's.
    pub fn push<U>(
        self,
        queue: &Queue,
        f: impl FnOnce(T) -> FutureContext<U> + Send + 'static,
    ) -> FutureContext<U>
    where
        U: Clone + Send + 'static,
    {
        self.extend(queue, false, move |value| f(value).inner)
    }

    /// Swaps the innermost resource for the context `f` derives from it.
    ///
    /// Once the replacement is acquired, the innermost teardown runs and the
    /// replacement's teardowns take its place above the rest of the stack.
    /// If the replacement fails, the whole stack unwinds as usual.
    pub fn replace<U>(
        self,
        queue: &Queue,
        f: impl FnOnce(T) -> FutureContext<U> + Send + 'static,
    ) -> FutureContext<U>
    where
        U: Clone + Send + 'static,
    {
        self.extend(queue, true, move |value| f(value).inner)
    }

    /// Recovers a failed acquisition with the future `f` returns, keeping the
    /// context alive. The recovered context has no teardown of its own.
    ///
    /// Cancellation is not recovered.
    pub fn handle_error(
        self,
        queue: &Queue,
        f: impl FnOnce(FutureError) -> Future<T> + Send + 'static,
    ) -> Self {
        let inner = self.inner.handle_error(queue, move |e| {
            f(e).map(&Queue::inline(), |value| Scoped {
                value,
                teardowns: Vec::new(),
            })
        });
        Self { inner }
    }

    /// Adds a teardown that receives the current value.
    pub fn add_teardown(
        self,
        queue: &Queue,
        action: impl FnOnce(T, FutureState) -> Future<()> + Send + 'static,
    ) -> Self {
        let teardown_queue = queue.clone();
        self.extend(&Queue::inline(), false, move |value| {
            let captured = value.clone();
            Future::from_result(Scoped {
                value,
                teardowns: vec![Teardown::new(&teardown_queue, move |state| {
                    action(captured, state)
                })],
            })
        })
    }

    /// Runs `step` over the acquired value and stacks its teardowns on top.
    /// With `replace_top`, they replace the current innermost teardown.
    fn extend<U>(
        self,
        queue: &Queue,
        replace_top: bool,
        step: impl FnOnce(T) -> Future<Scoped<U>> + Send + 'static,
    ) -> FutureContext<U>
    where
        U: Clone + Send + 'static,
    {
        let extended: Future<Scoped<U>> = Future::new();
        let pending = cancel_slot(&extended);

        let target = extended.clone();
        self.inner.on_completion(queue, move |result| {
            let Scoped { value, teardowns } = match result {
                Ok(scoped) => scoped,
                Err(e) => {
                    target.fail(e);
                    return;
                }
            };
            if target.has_completed() {
                unwind(teardowns, FutureState::Cancelled);
                return;
            }

            let next = guarded(move || step(value));
            track(&pending, &target, &next);
            next.on_completion(&Queue::inline(), move |result| match result {
                Ok(pushed) => {
                    let mut stack = teardowns;
                    let replaced = if replace_top { stack.pop() } else { None };
                    let kept = stack.len();
                    stack.extend(pushed.teardowns);
                    let scoped = Scoped {
                        value: pushed.value,
                        teardowns: stack,
                    };
                    if target.resolve(scoped.clone()) {
                        if let Some(replaced) = replaced {
                            debug!(teardown = ?replaced.name(), "Releasing replaced context");
                            unwind(vec![replaced], FutureState::Done);
                        }
                    } else {
                        let mut stack = scoped.teardowns;
                        if let Some(replaced) = replaced {
                            stack.insert(kept, replaced);
                        }
                        unwind(stack, FutureState::Cancelled);
                    }
                }
                Err(e) => {
                    unwind(teardowns, state_of_error(&e));
                    target.fail(e);
                }
            });
        });
        FutureContext { inner: extended }
    }

    /// Consumes the context with `f` and then runs every teardown.
    ///
    /// The returned future resolves with the result of `f`'s future; the
    /// teardowns then run with that result's state. `f` is only called if
    /// the acquisition succeeded. Cancelling the returned future cancels
    /// `f`'s future, or, while the acquisition is still pending, releases
    /// the resource as soon as it is acquired.
    pub fn pop<U>(self, queue: &Queue, f: impl FnOnce(T) -> Future<U> + Send + 'static) -> Future<U>
    where
        U: Clone + Send + 'static,
    {
        let popped = Future::new();
        let consumer = cancel_slot(&popped);

        let target = popped.clone();
        self.inner.on_completion(queue, move |result| {
            let Scoped { value, teardowns } = match result {
                Ok(scoped) => scoped,
                Err(e) => {
                    target.fail(e);
                    return;
                }
            };
            if target.has_completed() {
                debug!("Context consumer cancelled before acquisition finished, releasing");
                unwind(teardowns, FutureState::Cancelled);
                return;
            }

            let running = guarded(move || f(value));
            track(&consumer, &target, &running);
            running.on_completion(&Queue::inline(), move |result| {
                let state = FutureState::of(&result);
                target.settle(result);
                unwind(teardowns, state);
            });
        });
        popped
    }

    /// Hands the teardown to a longer-lived owner.
    ///
    /// `f` receives the value and a release future; the teardowns run once
    /// the release future resolves or is cancelled.
    pub fn enter<R>(
        self,
        queue: &Queue,
        f: impl FnOnce(T, Future<()>) -> R + Send + 'static,
    ) -> Future<R>
    where
        R: Clone + Send + 'static,
    {
        let entered = Future::new();
        let target = entered.clone();
        self.inner.on_completion(queue, move |result| {
            let Scoped { value, teardowns } = match result {
                Ok(scoped) => scoped,
                Err(e) => {
                    target.fail(e);
                    return;
                }
            };
            if target.has_completed() {
                unwind(teardowns, FutureState::Cancelled);
                return;
            }

            let release = Future::new();
            release.on_completion(&Queue::inline(), move |result: FutureResult<()>| {
                unwind(teardowns, FutureState::of(&result));
            });
            let handed = release.clone();
            match std::panic::catch_unwind(AssertUnwindSafe(move || f(value, handed))) {
                Ok(entered) => {
                    target.resolve(entered);
                }
                Err(panic) => {
                    warn!("Context entry panicked: {:?}", panic);
                    release.fail(FutureError::msg("Context entry panicked"));
                    target.fail(FutureError::msg(format!("Context entry panicked: {panic:?}")));
                }
            }
        });
        entered
    }
}

impl<T> FutureContext<Vec<T>>
where
    T: Clone + Send + 'static,
{
    /// Combines contexts acquired in parallel.
    ///
    /// Values keep input order. Teardowns of the joined context run in
    /// reverse input order. If any acquisition fails, the resources that
    /// were acquired are released and the first error, in input order, is
    /// reported.
    pub fn join(contexts: Vec<FutureContext<T>>) -> Self {
        let joined = Future::new();
        let target = joined.clone();
        let inners = contexts.into_iter().map(|context| context.inner).collect();

        collect_settled(inners).on_completion(&Queue::inline(), move |settled| {
            let results = match settled {
                Ok(results) => results,
                Err(e) => {
                    target.fail(e);
                    return;
                }
            };

            let mut values = Vec::with_capacity(results.len());
            let mut teardowns = Vec::new();
            let mut first_error = None;
            for result in results {
                match result {
                    Ok(scoped) => {
                        values.push(scoped.value);
                        teardowns.extend(scoped.teardowns);
                    }
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }

            if let Some(e) = first_error {
                unwind(teardowns, state_of_error(&e));
                target.fail(e);
                return;
            }
            let scoped = Scoped { value: values, teardowns };
            if !target.resolve(scoped.clone()) {
                unwind(scoped.teardowns, FutureState::Cancelled);
            }
        });
        Self { inner: joined }
    }
}

impl<T> fmt::Debug for FutureContext<T>
where
    T: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureContext")
            .field("state", &self.state())
            .field("depth", &self.depth())
            .finish()
    }
}

type CancelSlot<U> = Arc<Mutex<Option<WeakFuture<U>>>>;

/// Registers a responder on `outer` that cancels whatever future is later
/// placed in the returned slot.
fn cancel_slot<T, U>(outer: &Future<T>) -> CancelSlot<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
{
    let slot: CancelSlot<U> = Arc::new(Mutex::new(None));
    let on_cancel = slot.clone();
    outer.respond_to_cancellation(&Queue::inline(), move || {
        let running = on_cancel.lock().take().and_then(|weak| weak.upgrade());
        running.map_or_else(Future::empty, |running| running.cancel())
    });
    slot
}

/// Places `running` in `slot`, cancelling it if `outer` was cancelled before
/// the slot was filled.
fn track<T, U>(slot: &CancelSlot<U>, outer: &Future<T>, running: &Future<U>)
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
{
    *slot.lock() = Some(running.downgrade());
    if outer.state() == FutureState::Cancelled {
        running.cancel();
    }
}

impl<T> Future<T>
where
    T: Clone + Send + 'static,
{
    /// Turns the future's value into a context torn down by `action`.
    ///
    /// `action` only runs if the future succeeds; it receives the value and
    /// the terminal state of the consumer.
    pub fn contextual_teardown(
        &self,
        queue: &Queue,
        action: impl FnOnce(T, FutureState) -> Future<()> + Send + 'static,
    ) -> FutureContext<T> {
        FutureContext::from_future(self).add_teardown(queue, action)
    }
}
