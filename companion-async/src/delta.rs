//! Shared sessions over continuous operations.
//!
//! A [`DeltaUpdateManager`] lets independent clients attach to and detach
//! from one expensive continuous operation per key. The first `start` for a
//! key invokes its starter; later starts reuse the session and only bump its
//! reference count. The `stop` that drops the count to zero terminates the
//! operation and returns the session's final payload.
//!
//! Every transition of a key's entry happens under that key's map lock,
//! which is never held while user code runs. Distinct keys never contend.
//!
//! With an expiration configured, a session that receives no start or
//! update for that long is torn down regardless of its attachments.

use crate::errors::{FutureError, FutureResult};
use crate::future::{Future, FutureState};
use crate::operation::Operation;
use crate::queue::Queue;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The token a starter resolves with.
pub trait DeltaSession<Input, Payload>: Clone + Send + Sync + 'static {
    /// The operation backing the session.
    fn operation(&self) -> Operation;

    /// Forwards an input chunk to the session.
    fn update(&self, input: Input) -> Future<()>;

    /// The payload accumulated so far.
    fn snapshot(&self) -> Payload;
}

/// Configuration for a [`DeltaUpdateManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaManagerConfig {
    /// Name used in logs and errors.
    pub name: String,
    /// Maximum number of concurrently live keys, if bounded.
    pub capacity: Option<usize>,
    /// Idle time after which a session is stopped automatically.
    pub expiration: Option<Duration>,
}

impl Default for DeltaManagerConfig {
    fn default() -> Self {
        Self {
            name: "delta".to_string(),
            capacity: None,
            expiration: None,
        }
    }
}

impl DeltaManagerConfig {
    /// Creates a config with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Bounds the number of live keys.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Stops sessions that go `expiration` without a start or update.
    #[must_use]
    pub const fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }
}

/// What a call to [`DeltaUpdateManager::stop`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome<Payload> {
    /// The last attachment was released; the session was torn down and this
    /// is its final payload.
    Stopped(Payload),
    /// Other clients are still attached.
    Detached {
        /// Attachments left after this one.
        remaining: usize,
    },
    /// Nothing was attached under the key.
    AlreadyStopped,
}

impl<Payload> StopOutcome<Payload> {
    /// Returns true if this stop tore the session down.
    pub const fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }

    /// The final payload, if the session was torn down.
    pub const fn payload(&self) -> Option<&Payload> {
        match self {
            Self::Stopped(payload) => Some(payload),
            _ => None,
        }
    }

    /// Converts the outcome into the error taxonomy, reporting
    /// [`FutureError::AlreadyStopped`] for `key`.
    pub fn into_payload(self, key: &impl fmt::Display) -> FutureResult<Option<Payload>> {
        match self {
            Self::Stopped(payload) => Ok(Some(payload)),
            Self::Detached { .. } => Ok(None),
            Self::AlreadyStopped => Err(FutureError::AlreadyStopped {
                key: key.to_string(),
            }),
        }
    }
}

/// Lifecycle of a session entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// The starter is running.
    Starting,
    /// The session is live.
    Active,
    /// The operation is being torn down.
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// A point-in-time description of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo<K> {
    /// Identifier of this activation cycle.
    pub id: Uuid,
    /// The session key.
    pub key: K,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Number of attached clients.
    pub ref_count: usize,
    /// When the starter was invoked.
    pub started_at: DateTime<Utc>,
}

impl<K: fmt::Display> SessionInfo<K> {
    /// Converts to dictionary.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("id".to_string(), serde_json::json!(self.id.to_string()));
        map.insert("key".to_string(), serde_json::json!(self.key.to_string()));
        map.insert("state".to_string(), serde_json::json!(self.state.to_string()));
        map.insert("ref_count".to_string(), serde_json::json!(self.ref_count));
        map.insert(
            "started_at".to_string(),
            serde_json::json!(self.started_at.to_rfc3339()),
        );
        map
    }
}

#[derive(Debug, Clone, Copy)]
struct Activation {
    id: Uuid,
    started_at: DateTime<Utc>,
}

impl Activation {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

/// The pending idle timer of an active session.
#[derive(Default)]
struct Expiry {
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Drop for Expiry {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

enum SessionEntry<Token> {
    Starting {
        activation: Activation,
        token: Future<Token>,
        ref_count: usize,
    },
    Active {
        activation: Activation,
        token: Token,
        ref_count: usize,
        expiry: Expiry,
    },
    Stopping {
        activation: Activation,
        done: Future<()>,
    },
}

impl<Token> SessionEntry<Token> {
    const fn activation(&self) -> Activation {
        match self {
            Self::Starting { activation, .. }
            | Self::Active { activation, .. }
            | Self::Stopping { activation, .. } => *activation,
        }
    }

    const fn state(&self) -> SessionState {
        match self {
            Self::Starting { .. } => SessionState::Starting,
            Self::Active { .. } => SessionState::Active,
            Self::Stopping { .. } => SessionState::Stopping,
        }
    }

    const fn ref_count(&self) -> usize {
        match self {
            Self::Starting { ref_count, .. } | Self::Active { ref_count, .. } => *ref_count,
            Self::Stopping { .. } => 0,
        }
    }
}

type Starter<Token> = Box<dyn FnOnce() -> Future<Token> + Send + 'static>;

enum StartPlan<Token> {
    Invoke(Activation, Future<Token>),
    Join(Activation, Future<Token>),
    Ready(Activation, Token),
    AfterStop(Future<()>),
    Full(usize),
}

enum StopPlan<Token> {
    Absent,
    AwaitStart(Uuid, Future<Token>),
    Detached(usize),
    Teardown(Activation, Token, Future<()>),
}

enum Lookup<Token> {
    Ready(Token),
    Pending(Future<Token>),
}

struct Shared<Token, K> {
    config: DeltaManagerConfig,
    sessions: DashMap<K, SessionEntry<Token>>,
    live: AtomicUsize,
    timers: Option<Queue>,
}

/// A keyed manager of shared continuous sessions.
///
/// Cloning the manager shares its session map.
pub struct DeltaUpdateManager<Input, Token, Payload, K = String> {
    shared: Arc<Shared<Token, K>>,
    _marker: PhantomData<fn(Input) -> Payload>,
}

impl<Input, Token, Payload, K> Clone for DeltaUpdateManager<Input, Token, Payload, K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _marker: PhantomData,
        }
    }
}

impl<Input, Token, Payload, K> fmt::Debug for DeltaUpdateManager<Input, Token, Payload, K>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaUpdateManager")
            .field("config", &self.shared.config)
            .field("sessions", &self.shared.sessions.len())
            .finish()
    }
}

impl<Input, Token, Payload, K> Default for DeltaUpdateManager<Input, Token, Payload, K>
where
    Input: Send + 'static,
    Token: DeltaSession<Input, Payload>,
    Payload: Clone + Send + 'static,
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(DeltaManagerConfig::default())
    }
}

impl<Input, Token, Payload, K> DeltaUpdateManager<Input, Token, Payload, K>
where
    Input: Send + 'static,
    Token: DeltaSession<Input, Payload>,
    Payload: Clone + Send + 'static,
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
{
    /// Creates an empty manager.
    #[must_use]
    ///
    /// Expiry timers run on the runtime current at construction, or on the
    /// ambient runtime of whichever thread arms them.
    pub fn new(config: DeltaManagerConfig) -> Self {
        let timers = config
            .expiration
            .and_then(|_| Handle::try_current().ok())
            .map(|handle| Queue::serial_on(format!("{}.expiry", config.name), &handle));
        Self {
            shared: Arc::new(Shared {
                config,
                sessions: DashMap::new(),
                live: AtomicUsize::new(0),
                timers,
            }),
            _marker: PhantomData,
        }
    }

    /// The manager's name.
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// The manager's configuration.
    pub fn config(&self) -> &DeltaManagerConfig {
        &self.shared.config
    }

    /// Attaches to the session for `key`, starting it with `starter` if no
    /// session is live.
    ///
    /// Concurrent starts for one key invoke exactly one starter and all
    /// resolve with the same token. If that starter fails, only its caller
    /// sees the failure; callers that joined it fall back to their own
    /// starters. A start that arrives while the key is being torn down
    /// waits and begins a fresh session.
    ///
    /// Cancelling the returned future detaches the caller, as if
    /// [`DeltaUpdateManager::stop`] had been called once on its behalf.
    pub fn start(
        &self,
        key: K,
        starter: impl FnOnce() -> Future<Token> + Send + 'static,
    ) -> Future<Token> {
        let attached = Future::new();
        let attachment = Arc::new(Mutex::new(None));

        let manager = self.clone();
        let detach_key = key.clone();
        let on_cancel = attachment.clone();
        attached.respond_to_cancellation(&Queue::inline(), move || {
            let activation = on_cancel.lock().take();
            activation.map_or_else(Future::empty, |id| {
                debug!(key = %detach_key, "Start cancelled, detaching");
                manager.stop_activation(&detach_key, Some(id)).map_replace(())
            })
        });

        self.attach(key, Box::new(starter), attached.clone(), attachment);
        attached
    }

    fn attach(
        &self,
        key: K,
        starter: Starter<Token>,
        target: Future<Token>,
        attachment: Arc<Mutex<Option<Uuid>>>,
    ) {
        if target.has_completed() {
            return;
        }

        let plan = self.plan_start(&key);
        let detach_key = key.clone();
        let attached_to = match &plan {
            StartPlan::Invoke(activation, _)
            | StartPlan::Join(activation, _)
            | StartPlan::Ready(activation, _) => Some(activation.id),
            StartPlan::AfterStop(_) | StartPlan::Full(_) => None,
        };
        if let Some(id) = attached_to {
            *attachment.lock() = Some(id);
        }

        match plan {
            StartPlan::Full(capacity) => {
                warn!(manager = %self.name(), key = %key, capacity, "Session capacity exceeded");
                target.fail(FutureError::CapacityExceeded {
                    name: self.name().to_string(),
                    capacity,
                });
            }
            StartPlan::Ready(activation, token) => {
                debug!(manager = %self.name(), key = %key, session = %activation.id, "Attached to active session");
                target.resolve(token);
            }
            StartPlan::Invoke(activation, shared) => {
                info!(manager = %self.name(), key = %key, session = %activation.id, "Starting session");
                let started = invoke_starter(starter);
                let manager = self.clone();
                let started_key = key.clone();
                let token = shared.clone();
                started.on_completion(&Queue::inline(), move |result| {
                    manager.finish_start(&started_key, activation.id, &token, result);
                });
                self.follow(key, &shared, None, target.clone(), attachment.clone());
            }
            StartPlan::Join(activation, shared) => {
                debug!(manager = %self.name(), key = %key, session = %activation.id, "Joined pending session start");
                self.follow(key, &shared, Some(starter), target.clone(), attachment.clone());
            }
            StartPlan::AfterStop(done) => {
                debug!(manager = %self.name(), key = %key, "Session is stopping, restarting after teardown");
                let manager = self.clone();
                let target = target.clone();
                done.on_completion(&Queue::inline(), move |_| {
                    manager.attach(key, starter, target, attachment);
                });
                return;
            }
        }

        // The caller may have cancelled before the attachment was recorded.
        if target.state() == FutureState::Cancelled {
            let activation = attachment.lock().take();
            if let Some(id) = activation {
                self.stop_activation(&detach_key, Some(id));
            }
        }
    }

    fn plan_start(&self, key: &K) -> StartPlan<Token> {
        match self.shared.sessions.entry(key.clone()) {
            MapEntry::Occupied(mut occupied) => match occupied.get_mut() {
                SessionEntry::Starting {
                    activation,
                    token,
                    ref_count,
                } => {
                    *ref_count += 1;
                    StartPlan::Join(*activation, token.clone())
                }
                SessionEntry::Active {
                    activation,
                    token,
                    ref_count,
                    expiry,
                } => {
                    *ref_count += 1;
                    self.arm_expiry(key, activation.id, expiry);
                    StartPlan::Ready(*activation, token.clone())
                }
                SessionEntry::Stopping { done, .. } => StartPlan::AfterStop(done.clone()),
            },
            MapEntry::Vacant(vacant) => {
                if let Err(capacity) = self.reserve_slot() {
                    return StartPlan::Full(capacity);
                }
                let activation = Activation::new();
                let token = Future::new();
                vacant.insert(SessionEntry::Starting {
                    activation,
                    token: token.clone(),
                    ref_count: 1,
                });
                StartPlan::Invoke(activation, token)
            }
        }
    }

    /// Settles `target` from a pending start, falling back to `fallback` if
    /// the pending start fails.
    fn follow(
        &self,
        key: K,
        shared: &Future<Token>,
        fallback: Option<Starter<Token>>,
        target: Future<Token>,
        attachment: Arc<Mutex<Option<Uuid>>>,
    ) {
        let manager = self.clone();
        shared.on_completion(&Queue::inline(), move |result| match (result, fallback) {
            (Ok(token), _) => {
                target.resolve(token);
            }
            (Err(e), Some(starter)) if !target.has_completed() => {
                debug!(manager = %manager.name(), key = %key, error = %e, "Pending start failed, starting again");
                *attachment.lock() = None;
                manager.attach(key, starter, target, attachment);
            }
            (Err(e), _) => {
                *attachment.lock() = None;
                target.fail(e);
            }
        });
    }

    fn finish_start(&self, key: &K, id: Uuid, shared: &Future<Token>, result: FutureResult<Token>) {
        match result {
            Ok(token) => {
                if let Some(mut entry) = self.shared.sessions.get_mut(key) {
                    let promoted = match &*entry {
                        SessionEntry::Starting {
                            activation,
                            ref_count,
                            ..
                        } if activation.id == id => Some(SessionEntry::Active {
                            activation: *activation,
                            token: token.clone(),
                            ref_count: *ref_count,
                            expiry: Expiry::default(),
                        }),
                        _ => None,
                    };
                    if let Some(promoted) = promoted {
                        *entry = promoted;
                        if let SessionEntry::Active { expiry, .. } = &mut *entry {
                            self.arm_expiry(key, id, expiry);
                        }
                    }
                }
                info!(manager = %self.name(), key = %key, session = %id, "Session started");
                shared.resolve(token);
            }
            Err(e) => {
                self.remove(key, id);
                warn!(manager = %self.name(), key = %key, session = %id, error = %e, "Session failed to start");
                shared.fail(e);
            }
        }
    }

    /// Forwards `input` to the session for `key`.
    ///
    /// A session that is still starting receives the input once started.
    pub fn update(&self, key: &K, input: Input) -> Future<()> {
        match self.lookup(key) {
            Some(Lookup::Ready(token)) => {
                self.touch(key);
                token.update(input)
            }
            Some(Lookup::Pending(token)) => {
                token.observe().chain(&Queue::inline(), move |token| token.update(input))
            }
            None => Future::from_error(self.not_found(key)),
        }
    }

    /// Detaches one client from the session for `key`.
    ///
    /// The stop that releases the last attachment terminates the operation,
    /// waits for it to complete, removes the session and resolves with the
    /// session's final payload. If the operation completes with an error
    /// the session is still removed and the error is reported. A stop with
    /// no attachment resolves [`StopOutcome::AlreadyStopped`] and changes
    /// nothing. A stop during a pending start takes effect once the start
    /// has settled.
    pub fn stop(&self, key: &K) -> Future<StopOutcome<Payload>> {
        self.stop_activation(key, None)
    }

    /// Like [`DeltaUpdateManager::stop`], reporting
    /// [`FutureError::AlreadyStopped`] instead of an outcome. Resolves with
    /// the final payload only on the last detach.
    pub fn stop_payload(&self, key: &K) -> Future<Option<Payload>> {
        let reported = key.clone();
        self.stop(key).chain(&Queue::inline(), move |outcome| {
            let result = outcome.into_payload(&reported);
            match result {
                Ok(payload) => Future::from_result(payload),
                Err(e) => Future::from_error(e),
            }
        })
    }

    fn stop_activation(&self, key: &K, expected: Option<Uuid>) -> Future<StopOutcome<Payload>> {
        match self.plan_stop(key, expected) {
            StopPlan::Absent => {
                debug!(manager = %self.name(), key = %key, "No attachment to stop");
                Future::from_result(StopOutcome::AlreadyStopped)
            }
            StopPlan::Detached(remaining) => {
                debug!(manager = %self.name(), key = %key, remaining, "Detached from session");
                Future::from_result(StopOutcome::Detached { remaining })
            }
            StopPlan::AwaitStart(id, token) => {
                let deferred = Future::new();
                let target = deferred.clone();
                let manager = self.clone();
                let key = key.clone();
                token.on_completion(&Queue::inline(), move |_| {
                    target.resolve_from(&manager.stop_activation(&key, Some(id)));
                });
                deferred
            }
            StopPlan::Teardown(activation, token, done) => {
                info!(manager = %self.name(), key = %key, session = %activation.id, "Stopping session");
                self.teardown(key, activation, &token, done)
            }
        }
    }

    /// Terminates the operation of a session already marked as stopping,
    /// then removes it.
    fn teardown(
        &self,
        key: &K,
        activation: Activation,
        token: &Token,
        done: Future<()>,
    ) -> Future<StopOutcome<Payload>> {
        let stopped = Future::new();
        let target = stopped.clone();
        let manager = self.clone();
        let key = key.clone();
        let snapshot = token.clone();
        token.operation().terminate().on_completion(&Queue::inline(), move |result| {
            let payload = snapshot.snapshot();
            manager.remove(&key, activation.id);
            done.resolve(());
            match result {
                Ok(()) | Err(FutureError::Cancelled) => {
                    info!(manager = %manager.name(), key = %key, session = %activation.id, "Session stopped");
                    target.resolve(StopOutcome::Stopped(payload));
                }
                Err(e) => {
                    warn!(manager = %manager.name(), key = %key, session = %activation.id, error = %e, "Session teardown failed");
                    target.fail(e);
                }
            }
        });
        stopped
    }

    /// Restarts the idle timer of an active session.
    fn arm_expiry(&self, key: &K, id: Uuid, expiry: &mut Expiry) {
        let Some(expiration) = self.shared.config.expiration else {
            return;
        };
        expiry.generation += 1;
        if let Some(timer) = expiry.timer.take() {
            timer.abort();
        }

        let generation = expiry.generation;
        let manager = self.clone();
        let expired = key.clone();
        let timers = self.shared.timers.clone().unwrap_or_else(Queue::inline);
        match timers.dispatch_after(expiration, move || manager.expire(&expired, id, generation)) {
            Ok(timer) => expiry.timer = Some(timer),
            Err(e) => {
                warn!(manager = %self.name(), key = %key, session = %id, error = %e, "Session expiry could not be scheduled");
            }
        }
    }

    fn touch(&self, key: &K) {
        if self.shared.config.expiration.is_none() {
            return;
        }
        if let Some(mut entry) = self.shared.sessions.get_mut(key) {
            if let SessionEntry::Active {
                activation, expiry, ..
            } = &mut *entry
            {
                self.arm_expiry(key, activation.id, expiry);
            }
        }
    }

    /// Tears down an activation whose idle timer of `generation` fired.
    fn expire(&self, key: &K, id: Uuid, generation: u64) {
        let MapEntry::Occupied(mut occupied) = self.shared.sessions.entry(key.clone()) else {
            return;
        };
        let (activation, token, attached) = match occupied.get() {
            SessionEntry::Active {
                activation,
                token,
                ref_count,
                expiry,
            } if activation.id == id && expiry.generation == generation => {
                (*activation, token.clone(), *ref_count)
            }
            _ => return,
        };
        let done = Future::new();
        occupied.insert(SessionEntry::Stopping {
            activation,
            done: done.clone(),
        });
        drop(occupied);

        info!(manager = %self.name(), key = %key, session = %id, attached, "Session expired, stopping");
        self.teardown(key, activation, &token, done);
    }

    fn plan_stop(&self, key: &K, expected: Option<Uuid>) -> StopPlan<Token> {
        let MapEntry::Occupied(mut occupied) = self.shared.sessions.entry(key.clone()) else {
            return StopPlan::Absent;
        };
        let activation = occupied.get().activation();
        if expected.is_some_and(|id| id != activation.id) {
            return StopPlan::Absent;
        }

        let plan = match occupied.get_mut() {
            SessionEntry::Starting { token, .. } => StopPlan::AwaitStart(activation.id, token.clone()),
            SessionEntry::Active { ref_count, .. } if *ref_count > 1 => {
                *ref_count -= 1;
                StopPlan::Detached(*ref_count)
            }
            SessionEntry::Active { token, .. } => {
                StopPlan::Teardown(activation, token.clone(), Future::new())
            }
            SessionEntry::Stopping { .. } => StopPlan::Absent,
        };
        if let StopPlan::Teardown(activation, _, done) = &plan {
            occupied.insert(SessionEntry::Stopping {
                activation: *activation,
                done: done.clone(),
            });
        }
        plan
    }

    /// Resolves with the session for `key`, or with the sole live session
    /// when `key` is `None`.
    pub fn session(&self, key: Option<&K>) -> Future<Token> {
        let key = match key {
            Some(key) => key.clone(),
            None => {
                let keys = self.active_keys();
                match keys.as_slice() {
                    [only] => only.clone(),
                    [] => {
                        return Future::from_error(FutureError::SessionNotFound {
                            key: "<any>".to_string(),
                        })
                    }
                    many => {
                        return Future::from_error(FutureError::msg(format!(
                            "{} sessions are active in '{}', a key is required",
                            many.len(),
                            self.name()
                        )))
                    }
                }
            }
        };
        match self.lookup(&key) {
            Some(Lookup::Ready(token)) => Future::from_result(token),
            Some(Lookup::Pending(token)) => token.observe(),
            None => Future::from_error(self.not_found(&key)),
        }
    }

    /// Keys of the sessions that are starting or active.
    pub fn active_keys(&self) -> Vec<K> {
        self.shared
            .sessions
            .iter()
            .filter(|entry| entry.value().state() != SessionState::Stopping)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of clients attached under `key`.
    pub fn ref_count(&self, key: &K) -> usize {
        self.shared
            .sessions
            .get(key)
            .map_or(0, |entry| entry.value().ref_count())
    }

    /// Describes the session for `key`.
    pub fn session_info(&self, key: &K) -> Option<SessionInfo<K>> {
        self.shared.sessions.get(key).map(|entry| {
            let activation = entry.value().activation();
            SessionInfo {
                id: activation.id,
                key: key.clone(),
                state: entry.value().state(),
                ref_count: entry.value().ref_count(),
                started_at: activation.started_at,
            }
        })
    }

    fn lookup(&self, key: &K) -> Option<Lookup<Token>> {
        let entry = self.shared.sessions.get(key)?;
        match entry.value() {
            SessionEntry::Active { token, .. } => Some(Lookup::Ready(token.clone())),
            SessionEntry::Starting { token, .. } => Some(Lookup::Pending(token.clone())),
            SessionEntry::Stopping { .. } => None,
        }
    }

    fn not_found(&self, key: &K) -> FutureError {
        FutureError::SessionNotFound {
            key: key.to_string(),
        }
    }

    fn remove(&self, key: &K, id: Uuid) {
        let removed = self
            .shared
            .sessions
            .remove_if(key, |_, entry| entry.activation().id == id);
        if removed.is_some() {
            self.shared.live.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn reserve_slot(&self) -> Result<(), usize> {
        match self.shared.config.capacity {
            None => {
                self.shared.live.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Some(capacity) => self
                .shared
                .live
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                    (live < capacity).then_some(live + 1)
                })
                .map(|_| ())
                .map_err(|_| capacity),
        }
    }
}

fn invoke_starter<Token>(starter: Starter<Token>) -> Future<Token>
where
    Token: Clone + Send + 'static,
{
    std::panic::catch_unwind(AssertUnwindSafe(starter)).unwrap_or_else(|panic| {
        warn!("Session starter panicked: {:?}", panic);
        Future::from_error(FutureError::msg(format!("Session starter panicked: {panic:?}")))
    })
}
