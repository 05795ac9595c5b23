//! A pool of one expensive context shared between utilizations.
//!
//! A [`FutureContextManager`] prepares its context lazily on the first
//! utilization and hands it out as a [`FutureContext`]. Consuming that
//! context returns the utilization to the manager instead of tearing the
//! resource down. Once nothing is utilizing it, the context is torn down
//! after the configured pool timeout, or immediately when there is none.
//!
//! An exclusive context has at most one utilization at a time; later
//! requests queue in arrival order. A sharable context is handed to every
//! request at once.

use crate::context::{FutureContext, Teardown};
use crate::errors::{FutureError, FutureResult};
use crate::future::{Future, FutureState};
use crate::queue::Queue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Prepares and tears down the context a manager pools.
pub trait ContextDelegate<T>: Send + Sync + 'static {
    /// Acquires a fresh context.
    fn prepare(&self) -> Future<T>;

    /// Releases a context that is no longer utilized.
    fn teardown(&self, context: T) -> Future<()>;
}

/// Configuration for a [`FutureContextManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextManagerConfig {
    /// Name used in logs and errors.
    pub name: String,
    /// How long an unused context is kept before teardown. `None` tears it
    /// down as soon as the last utilization returns.
    pub pool_timeout: Option<Duration>,
    /// Whether concurrent utilizations may share the context.
    pub sharable: bool,
}

impl Default for ContextManagerConfig {
    fn default() -> Self {
        Self {
            name: "context".to_string(),
            pool_timeout: None,
            sharable: false,
        }
    }
}

impl ContextManagerConfig {
    /// Creates an exclusive, unpooled config with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Keeps an unused context for `timeout` before tearing it down.
    #[must_use]
    pub const fn with_pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool_timeout = Some(timeout);
        self
    }

    /// Allows concurrent utilizations.
    #[must_use]
    pub const fn with_sharable(mut self, sharable: bool) -> Self {
        self.sharable = sharable;
        self
    }
}

struct Waiter {
    purpose: String,
    turn: Future<()>,
}

struct PoolState<T> {
    prepared: Option<Future<T>>,
    draining: Option<Future<()>>,
    users: Vec<String>,
    waiters: VecDeque<Waiter>,
    generation: u64,
    idle_timer: Option<JoinHandle<()>>,
}

impl<T> PoolState<T> {
    fn available(&self, sharable: bool) -> bool {
        self.waiters.is_empty() && (sharable || self.users.is_empty())
    }

    fn admit(&mut self, purpose: String) {
        self.users.push(purpose);
        self.generation += 1;
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

enum Released<T> {
    Absent,
    Busy,
    Granted(Future<()>),
    Teardown(T, Future<()>),
    Idle(u64, Duration),
}

struct Shared<T> {
    config: ContextManagerConfig,
    queue: Queue,
    delegate: Box<dyn ContextDelegate<T>>,
    state: Mutex<PoolState<T>>,
}

/// Lends one lazily prepared context to successive utilizations.
///
/// Cloning the manager shares its pool.
pub struct FutureContextManager<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for FutureContextManager<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for FutureContextManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("FutureContextManager")
            .field("config", &self.shared.config)
            .field("users", &state.users)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

impl<T> FutureContextManager<T>
where
    T: Clone + Send + 'static,
{
    /// Creates a manager whose idle timers and teardowns run on `queue`.
    pub fn new(config: ContextManagerConfig, queue: &Queue, delegate: impl ContextDelegate<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                queue: queue.clone(),
                delegate: Box::new(delegate),
                state: Mutex::new(PoolState {
                    prepared: None,
                    draining: None,
                    users: Vec::new(),
                    waiters: VecDeque::new(),
                    generation: 0,
                    idle_timer: None,
                }),
            }),
        }
    }

    /// The context's name.
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// The purposes currently utilizing the context.
    pub fn utilized_by(&self) -> Vec<String> {
        self.shared.state.lock().users.clone()
    }

    /// Returns true if a prepared context is held by the pool.
    pub fn is_prepared(&self) -> bool {
        self.shared
            .state
            .lock()
            .prepared
            .as_ref()
            .is_some_and(|prepared| prepared.state() == FutureState::Done)
    }

    /// Utilizes the context for `purpose`, preparing it if needed.
    ///
    /// An exclusive context that is in use is handed over once every earlier
    /// utilization has returned. Consuming the returned context returns the
    /// utilization. A failed preparation fails the context and is retried
    /// by the next utilization.
    pub fn utilize(&self, purpose: impl Into<String>) -> FutureContext<T> {
        let purpose = purpose.into();
        let turn = self.request_turn(&purpose);
        let manager = self.clone();
        FutureContext::with_context(move || {
            turn.chain(&Queue::inline(), move |()| {
                let prepared = manager.prepared();
                prepared.chain_any(&Queue::inline(), move |result| match result {
                    Ok(context) => {
                        let queue = manager.shared.queue.clone();
                        let name = format!("{}:{purpose}", manager.name());
                        let teardown = Teardown::new(&queue, move |_| {
                            manager.release(&purpose);
                            Future::empty()
                        })
                        .named(name);
                        Future::from_result((context, teardown))
                    }
                    Err(e) => {
                        warn!(context = %manager.name(), purpose = %purpose, error = %e, "Context preparation failed");
                        manager.release(&purpose);
                        Future::from_error(e)
                    }
                })
            })
        })
    }

    /// Utilizes the context for `purpose` if it is prepared and free now.
    pub fn utilize_now(&self, purpose: impl Into<String>) -> FutureResult<T> {
        let purpose = purpose.into();
        let mut state = self.shared.state.lock();
        let context = state
            .prepared
            .as_ref()
            .and_then(Future::value)
            .ok_or_else(|| self.unavailable("it has not been prepared"))?;
        if !state.available(self.shared.config.sharable) {
            let reason = format!("it is in use by {}", state.users.join(", "));
            return Err(self.unavailable(reason));
        }
        debug!(context = %self.name(), purpose = %purpose, "Utilizing prepared context");
        state.admit(purpose);
        Ok(context)
    }

    /// Returns a utilization made for `purpose`.
    pub fn return_now(&self, purpose: &str) -> FutureResult<()> {
        if self.release(purpose) {
            Ok(())
        } else {
            Err(self.unavailable(format!("it is not utilized for '{purpose}'")))
        }
    }

    fn unavailable(&self, reason: impl Into<String>) -> FutureError {
        FutureError::ContextUnavailable {
            name: self.name().to_string(),
            reason: reason.into(),
        }
    }

    fn request_turn(&self, purpose: &str) -> Future<()> {
        let mut state = self.shared.state.lock();
        if state.available(self.shared.config.sharable) {
            debug!(context = %self.name(), purpose = %purpose, "Context available");
            state.admit(purpose.to_string());
            return Future::empty();
        }
        debug!(context = %self.name(), purpose = %purpose, users = ?state.users, "Waiting for context");
        let turn = Future::new();
        state.waiters.push_back(Waiter {
            purpose: purpose.to_string(),
            turn: turn.clone(),
        });
        turn
    }

    /// The pooled context, preparing a new one once any teardown in flight
    /// has finished.
    fn prepared(&self) -> Future<T> {
        let (slot, draining) = {
            let mut state = self.shared.state.lock();
            if let Some(prepared) = &state.prepared {
                if !matches!(prepared.state(), FutureState::Failed | FutureState::Cancelled) {
                    return prepared.observe();
                }
            }
            let slot = Future::new();
            state.prepared = Some(slot.clone());
            (slot, state.draining.take())
        };

        let manager = self.clone();
        let target = slot.clone();
        let prepare = move || {
            info!(context = %manager.name(), "Preparing context");
            let prepared = std::panic::catch_unwind(AssertUnwindSafe(|| manager.shared.delegate.prepare()))
                .unwrap_or_else(|panic| {
                    Future::from_error(FutureError::msg(format!("Context preparation panicked: {panic:?}")))
                });
            target.resolve_from(&prepared);
        };
        match draining {
            Some(draining) => {
                draining.on_completion(&Queue::inline(), move |_| prepare());
            }
            None => prepare(),
        }
        slot.observe()
    }

    /// Drops one utilization for `purpose`. Returns false if there was none.
    fn release(&self, purpose: &str) -> bool {
        let released = {
            let mut state = self.shared.state.lock();
            self.plan_release(&mut state, purpose)
        };

        match released {
            Released::Absent => return false,
            Released::Busy => {}
            Released::Granted(turn) => {
                turn.resolve(());
            }
            Released::Teardown(context, done) => self.tear_down(context, done),
            Released::Idle(generation, timeout) => {
                let manager = self.clone();
                let scheduled = self
                    .shared
                    .queue
                    .dispatch_after(timeout, move || manager.expire(generation));
                match scheduled {
                    Ok(timer) => {
                        let mut state = self.shared.state.lock();
                        if state.generation == generation {
                            state.idle_timer = Some(timer);
                        } else {
                            timer.abort();
                        }
                    }
                    Err(e) => {
                        warn!(context = %self.name(), error = %e, "Pool timeout could not be scheduled, tearing down now");
                        self.expire(generation);
                    }
                }
            }
        }
        true
    }

    fn plan_release(&self, state: &mut PoolState<T>, purpose: &str) -> Released<T> {
        let Some(index) = state.users.iter().position(|user| user == purpose) else {
            return Released::Absent;
        };
        state.users.remove(index);
        debug!(context = %self.name(), purpose = %purpose, "Context returned");
        if !state.users.is_empty() {
            return Released::Busy;
        }

        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.turn.has_completed() {
                continue;
            }
            state.admit(waiter.purpose);
            return Released::Granted(waiter.turn);
        }

        let Some(context) = state.prepared.as_ref().and_then(Future::value) else {
            return Released::Busy;
        };
        match self.shared.config.pool_timeout {
            Some(timeout) if !timeout.is_zero() => Released::Idle(state.generation, timeout),
            _ => {
                let done = Future::new();
                state.prepared = None;
                state.draining = Some(done.clone());
                Released::Teardown(context, done)
            }
        }
    }

    /// Tears the context down if it has stayed unused since `generation`.
    fn expire(&self, generation: u64) {
        let expired = {
            let mut state = self.shared.state.lock();
            if state.generation != generation || !state.users.is_empty() {
                return;
            }
            state.idle_timer = None;
            let Some(context) = state.prepared.take().and_then(|prepared| prepared.value()) else {
                return;
            };
            let done = Future::new();
            state.draining = Some(done.clone());
            (context, done)
        };
        debug!(context = %self.name(), "Pool timeout elapsed");
        self.tear_down(expired.0, expired.1);
    }

    fn tear_down(&self, context: T, done: Future<()>) {
        info!(context = %self.name(), "Tearing down context");
        let name = self.name().to_string();
        let torn_down = std::panic::catch_unwind(AssertUnwindSafe(|| self.shared.delegate.teardown(context)))
            .unwrap_or_else(|panic| {
                Future::from_error(FutureError::msg(format!("Context teardown panicked: {panic:?}")))
            });
        torn_down.on_completion(&Queue::inline(), move |result| {
            if let Err(e) = result {
                warn!(context = %name, error = %e, "Context teardown failed");
            }
            done.resolve(());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CallCounter;
    use pretty_assertions::assert_eq;

    #[derive(Clone, Default)]
    struct Simulators {
        prepares: CallCounter,
        teardowns: CallCounter,
        failures: Arc<Mutex<usize>>,
    }

    impl ContextDelegate<String> for Simulators {
        fn prepare(&self) -> Future<String> {
            self.prepares.increment();
            let n = self.prepares.get();
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Future::from_error(FutureError::msg("simulator did not boot"));
            }
            Future::from_result(format!("sim-{n}"))
        }

        fn teardown(&self, _context: String) -> Future<()> {
            self.teardowns.increment();
            Future::empty()
        }
    }

    fn manager(config: ContextManagerConfig, simulators: &Simulators) -> FutureContextManager<String> {
        FutureContextManager::new(config, &Queue::inline(), simulators.clone())
    }

    #[test]
    fn test_exclusive_utilizations_queue() {
        let simulators = Simulators::default();
        let manager = manager(ContextManagerConfig::new("simulator"), &simulators);

        let first_done: Future<()> = Future::new();
        let first_done_clone = first_done.clone();
        let first = manager
            .utilize("install")
            .pop(&Queue::inline(), move |sim| first_done_clone.map(&Queue::inline(), move |()| sim));
        let second = manager
            .utilize("launch")
            .pop(&Queue::inline(), Future::from_result);

        assert_eq!(second.state(), FutureState::Running);
        assert_eq!(manager.utilized_by(), vec!["install".to_string()]);

        first_done.resolve(());
        assert_eq!(first.value().as_deref(), Some("sim-1"));
        assert_eq!(second.value().as_deref(), Some("sim-1"));
        assert_eq!(simulators.prepares.get(), 1);
        assert_eq!(simulators.teardowns.get(), 1);
        assert!(manager.utilized_by().is_empty());
        assert!(!manager.is_prepared());
    }

    #[test]
    fn test_sharable_utilizations_overlap() {
        let simulators = Simulators::default();
        let manager = manager(
            ContextManagerConfig::new("simulator").with_sharable(true),
            &simulators,
        );

        let release: Future<()> = Future::new();
        let held = release.clone();
        let first = manager
            .utilize("video")
            .pop(&Queue::inline(), move |sim| held.map(&Queue::inline(), move |()| sim));
        let second = manager
            .utilize("logs")
            .pop(&Queue::inline(), Future::from_result);

        assert_eq!(second.value().as_deref(), Some("sim-1"));
        assert_eq!(first.state(), FutureState::Running);
        assert_eq!(simulators.teardowns.get(), 0);

        release.resolve(());
        assert_eq!(first.value().as_deref(), Some("sim-1"));
        assert_eq!(simulators.prepares.get(), 1);
        assert_eq!(simulators.teardowns.get(), 1);
    }

    #[test]
    fn test_failed_preparation_is_retried() {
        let simulators = Simulators::default();
        *simulators.failures.lock() = 1;
        let manager = manager(ContextManagerConfig::new("simulator"), &simulators);

        let failed = manager.utilize("boot").pop(&Queue::inline(), Future::from_result);
        assert_eq!(failed.state(), FutureState::Failed);
        assert!(manager.utilized_by().is_empty());

        let retried = manager.utilize("boot").pop(&Queue::inline(), Future::from_result);
        assert_eq!(retried.value().as_deref(), Some("sim-2"));
        assert_eq!(simulators.teardowns.get(), 1);
    }

    #[test]
    fn test_utilize_now_requires_prepared_context() {
        let simulators = Simulators::default();
        let manager = manager(ContextManagerConfig::new("simulator"), &simulators);

        let err = manager.utilize_now("tap").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Context 'simulator' is unavailable: it has not been prepared"
        );
        assert!(manager.return_now("tap").is_err());
        assert_eq!(simulators.prepares.get(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pooled_context_is_reused_then_expires() {
        let simulators = Simulators::default();
        let manager = manager(
            ContextManagerConfig::new("simulator").with_pool_timeout(Duration::from_millis(100)),
            &simulators,
        );

        let first = manager.utilize("install").pop(&Queue::inline(), Future::from_result);
        assert_eq!(first.await.unwrap(), "sim-1");
        assert!(manager.is_prepared());
        assert_eq!(simulators.teardowns.get(), 0);

        assert_eq!(manager.utilize_now("tap").unwrap(), "sim-1");
        let busy = manager.utilize_now("swipe").unwrap_err();
        assert_eq!(
            busy.to_string(),
            "Context 'simulator' is unavailable: it is in use by tap"
        );
        manager.return_now("tap").unwrap();
        assert!(manager.return_now("tap").is_err());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = manager.utilize("launch").pop(&Queue::inline(), Future::from_result);
        assert_eq!(second.await.unwrap(), "sim-1");
        assert_eq!(simulators.prepares.get(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(simulators.teardowns.get(), 1);
        assert!(!manager.is_prepared());

        let third = manager.utilize("launch").pop(&Queue::inline(), Future::from_result);
        assert_eq!(third.await.unwrap(), "sim-2");
    }
}
