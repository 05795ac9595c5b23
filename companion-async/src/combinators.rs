//! Combinators deriving new futures from existing ones.
//!
//! A pending parent keeps the futures derived from it alive through its
//! completion handlers. Derived futures only hold weak handles to their
//! parents, used to propagate cancellation upstream, so no combinator
//! builds a reference cycle. Errors pass through unchanged unless a
//! combinator exists to recover from them.

use crate::errors::{FutureError, FutureResult};
use crate::future::{Future, FutureState, WeakFuture};
use crate::queue::Queue;
use crate::retry::RetryConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// What a polling closure reports back to
/// [`resolve_or_fail_when`].
#[derive(Debug, Clone)]
pub enum LoopState {
    /// Keep polling.
    Continue,
    /// Resolve successfully.
    Finished,
    /// Resolve with the given failure.
    Failed(FutureError),
}

/// Derives a future from every terminal result of `parent`.
///
/// Cancelling the derived future cancels `parent` and, once `step` has
/// run, the future it returned.
fn derive<T, U>(
    parent: &Future<T>,
    queue: &Queue,
    step: impl FnOnce(FutureResult<T>) -> Future<U> + Send + 'static,
) -> Future<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
{
    let derived = Future::new();
    derived.cancel_upstream_on_cancel(parent);

    let target = derived.clone();
    parent.on_completion(queue, move |result| {
        let next = step(result);
        target.resolve_from(&next);
    });
    derived
}

impl<T> Future<T>
where
    T: Clone + Send + 'static,
{
    /// Maps a successful value.
    pub fn map<U>(&self, queue: &Queue, f: impl FnOnce(T) -> U + Send + 'static) -> Future<U>
    where
        U: Clone + Send + 'static,
    {
        derive(self, queue, move |result| match result {
            Ok(value) => Future::from_result(f(value)),
            Err(e) => Future::from_error(e),
        })
    }

    /// Flat-maps a successful value into another future.
    ///
    /// `f` is never invoked if the receiver fails or is cancelled; the
    /// chained future then fails or cancels identically.
    pub fn chain<U>(
        &self,
        queue: &Queue,
        f: impl FnOnce(T) -> Future<U> + Send + 'static,
    ) -> Future<U>
    where
        U: Clone + Send + 'static,
    {
        derive(self, queue, move |result| match result {
            Ok(value) => f(value),
            Err(e) => Future::from_error(e),
        })
    }

    /// Chains on any terminal result, including cancellation.
    pub fn chain_any<U>(
        &self,
        queue: &Queue,
        f: impl FnOnce(FutureResult<T>) -> Future<U> + Send + 'static,
    ) -> Future<U>
    where
        U: Clone + Send + 'static,
    {
        derive(self, queue, f)
    }

    /// Recovers from a failure. Cancellation is not recoverable.
    pub fn handle_error(
        &self,
        queue: &Queue,
        f: impl FnOnce(FutureError) -> Self + Send + 'static,
    ) -> Self {
        derive(self, queue, move |result| match result {
            Ok(value) => Self::from_result(value),
            Err(FutureError::Cancelled) => Self::cancelled(),
            Err(e) => f(e),
        })
    }

    /// Replaces a failure with `value`.
    pub fn fallback(&self, value: T) -> Self {
        self.handle_error(&Queue::inline(), move |_| Self::from_result(value))
    }

    /// Replaces a successful value with `value`.
    pub fn map_replace<U>(&self, value: U) -> Future<U>
    where
        U: Clone + Send + 'static,
    {
        self.map(&Queue::inline(), move |_| value)
    }

    /// Continues with `replacement` once the receiver is terminal, whatever
    /// its result.
    pub fn chain_replace<U>(&self, replacement: Future<U>) -> Future<U>
    where
        U: Clone + Send + 'static,
    {
        self.chain_any(&Queue::inline(), move |_| replacement)
    }

    /// Adds context to an underlying failure.
    pub fn rephrase_failure(&self, context: impl Into<String>) -> Self {
        let context = context.into();
        derive(self, &Queue::inline(), move |result| {
            Self::from_error_or_value(result.map_err(|e| e.rephrase(context)))
        })
    }

    fn from_error_or_value(result: FutureResult<T>) -> Self {
        let future = Self::new();
        future.settle(result);
        future
    }

    /// Delivers the receiver's result after `interval`.
    ///
    /// Cancelling the delayed future before delivery resolves it cancelled
    /// immediately and cancels the receiver if still pending.
    pub fn delay(&self, queue: &Queue, interval: Duration) -> Self {
        let delayed = Self::new();
        delayed.cancel_upstream_on_cancel(self);

        let target = delayed.clone();
        let timer_queue = queue.clone();
        self.on_completion(&Queue::inline(), move |result| {
            let delayed = target;
            let deliver = delayed.clone();
            match timer_queue.dispatch_after(interval, move || {
                deliver.settle(result);
            }) {
                Ok(timer) => {
                    delayed.respond_to_cancellation(&Queue::inline(), move || {
                        timer.abort();
                        Future::empty()
                    });
                }
                Err(e) => {
                    delayed.fail(e);
                }
            }
        });
        delayed
    }

    /// Fails with [`FutureError::TimedOut`] if the receiver does not resolve
    /// within `interval`, cancelling the receiver.
    pub fn timeout(&self, queue: &Queue, interval: Duration, what: impl Into<String>) -> Self {
        let what = what.into();
        self.timeout_with(queue, interval, move || {
            Self::from_error(FutureError::timed_out(what))
        })
    }

    /// Like [`Future::timeout`], resolving from `handler` on expiry.
    pub fn timeout_with(
        &self,
        queue: &Queue,
        interval: Duration,
        handler: impl FnOnce() -> Self + Send + 'static,
    ) -> Self {
        let guarded = Self::new();
        let decided = Arc::new(AtomicBool::new(false));
        let timer: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));

        let timer_on_cancel = timer.clone();
        guarded.respond_to_cancellation(&Queue::inline(), move || {
            if let Some(timer) = timer_on_cancel.lock().take() {
                timer.abort();
            }
            Future::empty()
        });
        guarded.cancel_upstream_on_cancel(self);

        let on_expiry = {
            let target = guarded.clone();
            let upstream = self.downgrade();
            let decided = decided.clone();
            move || {
                if decided.swap(true, Ordering::AcqRel) {
                    return;
                }
                let replacement = handler();
                target.resolve_from(&replacement);
                if let Some(upstream) = upstream.upgrade() {
                    upstream.cancel();
                }
            }
        };
        match queue.dispatch_after(interval, on_expiry) {
            Ok(handle) => *timer.lock() = Some(handle),
            Err(e) => {
                guarded.fail(e);
                return guarded;
            }
        }

        let target = guarded.clone();
        self.on_completion(&Queue::inline(), move |result| {
            if decided.swap(true, Ordering::AcqRel) {
                return;
            }
            if let Some(timer) = timer.lock().take() {
                timer.abort();
            }
            target.settle(result);
        });
        guarded
    }
}

/// A future that succeeds after `interval`.
pub fn after(queue: &Queue, interval: Duration) -> Future<()> {
    Future::empty().delay(queue, interval)
}

/// Resolves with the first terminal result among `futures`, by completion
/// order, and cancels every other future that is still pending.
///
/// Cancelling the race cancels all contenders.
pub fn race<T>(futures: Vec<Future<T>>) -> Future<T>
where
    T: Clone + Send + 'static,
{
    let winner = Future::new();
    if futures.is_empty() {
        winner.fail(FutureError::msg("race requires at least one future"));
        return winner;
    }

    let siblings: Arc<Vec<WeakFuture<T>>> = Arc::new(futures.iter().map(Future::downgrade).collect());
    cancel_all_on_cancel(&winner, &siblings);

    let decided = Arc::new(AtomicBool::new(false));
    for (index, future) in futures.iter().enumerate() {
        let decided = decided.clone();
        let siblings = siblings.clone();
        let target = winner.clone();
        future.on_completion(&Queue::inline(), move |result| {
            if decided.swap(true, Ordering::AcqRel) {
                return;
            }
            target.settle(result);
            for (other, sibling) in siblings.iter().enumerate() {
                if other == index {
                    continue;
                }
                if let Some(sibling) = sibling.upgrade() {
                    sibling.cancel();
                }
            }
        });
    }
    winner
}

/// Resolves with all values, in input order, once every future succeeds.
///
/// The first failure or cancellation resolves the collection immediately
/// and cancels the futures that are still pending.
pub fn collect<T>(futures: Vec<Future<T>>) -> Future<Vec<T>>
where
    T: Clone + Send + 'static,
{
    let collected = Future::new();
    if futures.is_empty() {
        collected.resolve(Vec::new());
        return collected;
    }

    let siblings: Arc<Vec<WeakFuture<T>>> = Arc::new(futures.iter().map(Future::downgrade).collect());
    cancel_all_on_cancel(&collected, &siblings);

    let values: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; futures.len()]));
    let remaining = Arc::new(AtomicUsize::new(futures.len()));

    for (index, future) in futures.iter().enumerate() {
        let values = values.clone();
        let remaining = remaining.clone();
        let siblings = siblings.clone();
        let target = collected.clone();
        future.on_completion(&Queue::inline(), move |result| match result {
            Ok(value) => {
                values.lock()[index] = Some(value);
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let all: Option<Vec<T>> = std::mem::take(&mut *values.lock()).into_iter().collect();
                    if let Some(all) = all {
                        target.resolve(all);
                    }
                }
            }
            Err(e) => {
                if target.settle(Err(e)) {
                    for sibling in siblings.iter() {
                        if let Some(sibling) = sibling.upgrade() {
                            sibling.cancel();
                        }
                    }
                }
            }
        });
    }
    collected
}

/// Resolves once every future is terminal, with each result in input order.
///
/// Never fails; this is the all-settle counterpart of [`collect`].
pub fn collect_settled<T>(futures: Vec<Future<T>>) -> Future<Vec<FutureResult<T>>>
where
    T: Clone + Send + 'static,
{
    let settled = Future::new();
    if futures.is_empty() {
        settled.resolve(Vec::new());
        return settled;
    }

    let inputs: Arc<Vec<WeakFuture<T>>> = Arc::new(futures.iter().map(Future::downgrade).collect());
    cancel_all_on_cancel(&settled, &inputs);

    let results: Arc<Mutex<Vec<Option<FutureResult<T>>>>> =
        Arc::new(Mutex::new(vec![None; futures.len()]));
    let remaining = Arc::new(AtomicUsize::new(futures.len()));

    for (index, future) in futures.iter().enumerate() {
        let results = results.clone();
        let remaining = remaining.clone();
        let target = settled.clone();
        future.on_completion(&Queue::inline(), move |result| {
            results.lock()[index] = Some(result);
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                let all: Option<Vec<_>> = std::mem::take(&mut *results.lock()).into_iter().collect();
                if let Some(all) = all {
                    target.resolve(all);
                }
            }
        });
    }
    settled
}

fn cancel_all_on_cancel<T, U>(aggregate: &Future<U>, inputs: &Arc<Vec<WeakFuture<T>>>)
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
{
    let inputs = inputs.clone();
    aggregate.respond_to_cancellation(&Queue::inline(), move || {
        let drains = inputs
            .iter()
            .filter_map(WeakFuture::upgrade)
            .map(|input| input.cancel())
            .collect();
        collect_settled(drains).map_replace(())
    });
}

struct RetryLoop<T, F> {
    queue: Queue,
    config: RetryConfig,
    factory: Mutex<F>,
    attempts: AtomicUsize,
    current: Mutex<Option<WeakFuture<T>>>,
    target: Future<T>,
}

enum Step {
    Retry(Duration),
    Settled,
}

impl<T, F> RetryLoop<T, F>
where
    T: Clone + Send + 'static,
    F: FnMut() -> Future<T> + Send + 'static,
{
    /// Runs attempts until one is pending or the target settles.
    ///
    /// On an inline queue, attempts that finish synchronously and retry
    /// without delay are driven by this loop rather than by nested
    /// completion handlers, so the stack stays flat however many fail.
    fn run(self: Arc<Self>) {
        loop {
            if self.target.has_completed() {
                return;
            }

            let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
            let current = {
                let mut factory = self.factory.lock();
                (*factory)()
            };
            *self.current.lock() = Some(current.downgrade());

            // The target may have been cancelled while the factory ran, after
            // the cancel responder found nothing to cancel.
            if self.target.state() == FutureState::Cancelled {
                current.cancel();
                return;
            }

            if self.queue.is_inline() {
                if let Some(result) = current.result() {
                    match self.step(attempt, result) {
                        Step::Retry(delay) if delay.is_zero() => continue,
                        Step::Retry(delay) => Arc::clone(&self).schedule(delay),
                        Step::Settled => {}
                    }
                    return;
                }
            }

            let this = self.clone();
            current.on_completion(&self.queue, move |result| {
                if let Step::Retry(delay) = this.step(attempt, result) {
                    this.schedule(delay);
                }
            });
            return;
        }
    }

    fn step(&self, attempt: usize, result: FutureResult<T>) -> Step {
        let target = &self.target;
        match result {
            Ok(value) => {
                target.resolve(value);
                Step::Settled
            }
            Err(FutureError::Cancelled) => {
                target.cancel();
                Step::Settled
            }
            Err(e) if self.config.allows_another(attempt) && !target.has_completed() => {
                let delay = self.config.delay_for(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Retrying after error"
                );
                Step::Retry(delay)
            }
            Err(e) => {
                target.fail(e);
                Step::Settled
            }
        }
    }

    fn schedule(self: Arc<Self>, delay: Duration) {
        let next = self.clone();
        if delay.is_zero() {
            self.queue.dispatch(move || next.run());
        } else if let Err(e) = self.queue.dispatch_after(delay, move || next.run()) {
            self.target.fail(e);
        }
    }
}

/// Invokes `factory` for a fresh future until one succeeds or
/// `config.max_attempts` attempts have failed, waiting the configured
/// backoff between attempts.
///
/// Cancellation of an attempt, or of the returned future, stops retrying
/// immediately.
pub fn retry<T, F>(queue: &Queue, config: RetryConfig, factory: F) -> Future<T>
where
    T: Clone + Send + 'static,
    F: FnMut() -> Future<T> + Send + 'static,
{
    let target = Future::new();
    if config.max_attempts == 0 {
        target.fail(FutureError::msg("retry requires at least one attempt"));
        return target;
    }

    let retry_loop = Arc::new(RetryLoop {
        queue: queue.clone(),
        config,
        factory: Mutex::new(factory),
        attempts: AtomicUsize::new(0),
        current: Mutex::new(None),
        target: target.clone(),
    });

    let on_cancel = Arc::downgrade(&retry_loop);
    target.respond_to_cancellation(&Queue::inline(), move || {
        let current = on_cancel
            .upgrade()
            .and_then(|retry_loop| retry_loop.current.lock().take())
            .and_then(|current| current.upgrade());
        if let Some(current) = current {
            current.cancel();
        }
        Future::empty()
    });

    retry_loop.run();
    target
}

/// Re-invokes `factory` until a returned future succeeds, without delay.
pub fn resolve_until<T, F>(queue: &Queue, factory: F) -> Future<T>
where
    T: Clone + Send + 'static,
    F: FnMut() -> Future<T> + Send + 'static,
{
    let config = RetryConfig::new()
        .with_max_attempts(usize::MAX)
        .with_base_delay_ms(0);
    retry(queue, config, factory)
}

/// Polls `poll` every `interval` until it reports a terminal [`LoopState`].
pub fn resolve_or_fail_when<F>(queue: &Queue, interval: Duration, mut poll: F) -> Future<()>
where
    F: FnMut() -> LoopState + Send + 'static,
{
    Future::spawn(queue, async move {
        loop {
            match poll() {
                LoopState::Continue => tokio::time::sleep(interval).await,
                LoopState::Finished => return Ok(()),
                LoopState::Failed(e) => return Err(e),
            }
        }
    })
}

/// Polls `predicate` every `interval` and succeeds once it returns true.
pub fn resolve_when<F>(queue: &Queue, interval: Duration, mut predicate: F) -> Future<()>
where
    F: FnMut() -> bool + Send + 'static,
{
    resolve_or_fail_when(queue, interval, move || {
        if predicate() {
            LoopState::Finished
        } else {
            LoopState::Continue
        }
    })
}
