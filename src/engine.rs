//! Engine facade tying the registry, dispatcher and connection together.

use crate::connection::{ConnectionController, Transport};
use crate::dispatch::{EventDispatcher, InlineQueue, Notification, TaskQueue, WorkerQueue};
use crate::error::Result;
use crate::subscriptions::{DeferredSubscribe, SubscriptionRegistry, SubscriptionRequest};
use crate::types::{
    ChangeEvent, ConnectionState, RegistrationToken, SubscriptionErrorEvent, SubscriptionHandle,
    SubscriptionState,
};
use parking_lot::ReentrantMutex;
use serde::Deserialize;
use std::cell::RefCell;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Where callbacks and transport writes run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One worker thread for callbacks and one for transport writes.
    #[default]
    Worker,
    /// Everything runs on the calling thread.
    Inline,
}

/// Engine configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dispatch: DispatchMode,

    /// Prefix for worker thread names.
    pub worker_thread_name: String,

    /// Inbound frames longer than this are dropped.
    pub max_frame_bytes: usize,

    /// Trace every frame sent and received.
    pub log_frames: bool,

    /// A throttled subscribe is retried after `attempt² × retry_backoff_ms`.
    pub retry_backoff_ms: u64,

    /// Upper bound on the retry backoff.
    pub max_retry_backoff_ms: u64,
}

impl EngineConfig {
    /// Delay before retrying a subscribe throttled `attempt` times before.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let attempt = u64::from(attempt);
        let millis = attempt
            .saturating_mul(attempt)
            .saturating_mul(self.retry_backoff_ms)
            .min(self.max_retry_backoff_ms);
        Duration::from_millis(millis)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchMode::Worker,
            worker_thread_name: "rta".to_string(),
            max_frame_bytes: 1024 * 1024,
            log_frames: false,
            retry_backoff_ms: 1000,
            max_retry_backoff_ms: 60_000,
        }
    }
}

/// Everything guarded by the engine lock.
pub(crate) struct EngineState {
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) connection: ConnectionState,
    /// Between `activate` and `deactivate`.
    pub(crate) active: bool,
    /// Bumped whenever a session ends. Work drained under an older value is
    /// never written.
    pub(crate) session: u64,
}

impl EngineState {
    pub(crate) fn end_session(&mut self) {
        self.session = self.session.wrapping_add(1);
    }
}

/// The engine lock.
///
/// Re-entrant so a callback running inline can call back into the engine.
/// Borrows never outlive a [`with`](SharedState::with) closure, and no
/// closure calls out to a transport, queue or handler.
/// [`with_then`](SharedState::with_then) is the one place a queue is fed
/// under the lock.
pub(crate) struct SharedState {
    cell: ReentrantMutex<RefCell<EngineState>>,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            cell: ReentrantMutex::new(RefCell::new(EngineState {
                registry: SubscriptionRegistry::new(),
                dispatcher: EventDispatcher::new(),
                connection: ConnectionState::Disconnected,
                active: false,
                session: 0,
            })),
        }
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        let guard = self.cell.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    /// Like [`with`](Self::with), then hand the result to `then` with the
    /// borrow released but the lock still held, so anything `then` submits
    /// is queued ahead of later transitions.
    pub(crate) fn with_then<R>(
        &self,
        f: impl FnOnce(&mut EngineState) -> R,
        then: impl FnOnce(&mut R),
    ) -> R {
        let guard = self.cell.lock();
        let mut result = f(&mut guard.borrow_mut());
        then(&mut result);
        result
    }
}

struct EngineInner {
    shared: SharedState,
    controller: ConnectionController,
    io_queue: Arc<dyn TaskQueue>,
    config: EngineConfig,
}

/// Client-side multiplexer of RTA subscriptions over one transport.
///
/// Cheap to clone; clones share the same engine. Transports should hold a
/// [`WeakRtaEngine`] to report events without keeping the engine alive.
#[derive(Clone)]
pub struct RtaEngine {
    inner: Arc<EngineInner>,
}

impl RtaEngine {
    /// Create an engine with queues chosen by `config.dispatch`.
    pub fn new(transport: Arc<dyn Transport>, config: EngineConfig) -> Result<Self> {
        let (callback_queue, io_queue) = match config.dispatch {
            DispatchMode::Worker => {
                let name = &config.worker_thread_name;
                let callbacks: Arc<dyn TaskQueue> =
                    Arc::new(WorkerQueue::spawn(format!("{name}-callbacks"))?);
                let io: Arc<dyn TaskQueue> = Arc::new(WorkerQueue::spawn(format!("{name}-io"))?);
                (callbacks, io)
            }
            DispatchMode::Inline => {
                let inline: Arc<dyn TaskQueue> = Arc::new(InlineQueue);
                (Arc::clone(&inline), inline)
            }
        };
        Ok(Self::with_queues(transport, config, callback_queue, io_queue))
    }

    /// Create an engine on caller-supplied queues. `config.dispatch` is
    /// ignored.
    pub fn with_queues(
        transport: Arc<dyn Transport>,
        config: EngineConfig,
        callback_queue: Arc<dyn TaskQueue>,
        io_queue: Arc<dyn TaskQueue>,
    ) -> Self {
        debug!(?config, "creating engine");
        Self {
            inner: Arc::new(EngineInner {
                shared: SharedState::new(),
                controller: ConnectionController::new(transport, callback_queue, &config),
                io_queue,
                config,
            }),
        }
    }

    pub fn downgrade(&self) -> WeakRtaEngine {
        WeakRtaEngine {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        self.inner.shared.with(f)
    }

    fn deliver(&self, notifications: impl IntoIterator<Item = Notification>) {
        self.inner.controller.deliver(notifications);
    }

    // --- Lifecycle ---

    /// Start the session: announce `Connecting` and ask the transport to
    /// connect. Does nothing if already active.
    ///
    /// A synchronous connect failure is treated as a disconnect and leaves
    /// the engine inactive.
    pub fn activate(&self) -> Result<()> {
        let notification = self.with_state(|state| {
            if state.active {
                return None;
            }
            state.active = true;
            state.connection = ConnectionState::Connecting;
            Some(
                state
                    .dispatcher
                    .connection_state_notification(ConnectionState::Connecting),
            )
        });
        let Some(notification) = notification else {
            return Ok(());
        };
        debug!("activating");
        self.deliver(Some(notification));

        if let Err(error) = self.inner.controller.transport().connect() {
            warn!(%error, "connect failed");
            self.inner.controller.on_disconnected(&self.inner.shared);
            self.with_state(|state| state.active = false);
            return Err(error.into());
        }
        Ok(())
    }

    /// Stop the session and drop every subscription without error
    /// callbacks. `Disconnected` is still announced.
    pub fn deactivate(&self) {
        let notification = self.with_state(|state| {
            if !state.active {
                return None;
            }
            state.active = false;
            state.end_session();
            let dropped = state.registry.clear_all();
            debug!(dropped = dropped.len(), "deactivating");
            state.connection = ConnectionState::Disconnected;
            Some(
                state
                    .dispatcher
                    .connection_state_notification(ConnectionState::Disconnected),
            )
        });
        let Some(notification) = notification else {
            return;
        };
        self.inner.controller.transport().close();
        self.deliver(Some(notification));
    }

    pub fn is_active(&self) -> bool {
        self.with_state(|state| state.active)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.with_state(|state| state.connection)
    }

    // --- Subscriptions ---

    /// Subscribe to `resource_uri`. The request is sent as soon as the
    /// connection is up.
    pub fn subscribe<C, E>(
        &self,
        resource_uri: impl Into<String>,
        on_change: C,
        on_error: E,
    ) -> Result<SubscriptionHandle>
    where
        C: Fn(&ChangeEvent) + Send + Sync + 'static,
        E: Fn(&SubscriptionErrorEvent) + Send + Sync + 'static,
    {
        self.subscribe_with(SubscriptionRequest::new(resource_uri, on_change, on_error))
    }

    pub fn subscribe_with(&self, request: SubscriptionRequest) -> Result<SubscriptionHandle> {
        let handle = self.with_state(|state| state.registry.stage_subscribe(request))?;
        self.schedule_flush();
        Ok(handle)
    }

    /// Stop receiving events for `handle`. Unknown or already closed handles
    /// are ignored.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        self.with_state(|state| state.registry.stage_unsubscribe(handle))?;
        self.schedule_flush();
        Ok(())
    }

    /// `None` once the subscription has closed.
    pub fn subscription_state(&self, handle: SubscriptionHandle) -> Option<SubscriptionState> {
        self.with_state(|state| state.registry.state(handle))
    }

    pub fn subscription_count(&self) -> usize {
        self.with_state(|state| state.registry.len())
    }

    pub fn pending_submission_count(&self) -> usize {
        self.with_state(|state| state.registry.pending_submission_count())
    }

    /// Queue a flush on the I/O queue if there is anything to send.
    fn schedule_flush(&self) {
        let ready = self.with_state(|state| {
            state.active
                && state.connection == ConnectionState::Connected
                && state.registry.pending_submission_count() > 0
        });
        if !ready {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner.io_queue.submit(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.controller.flush(&inner.shared);
            }
        }));
    }

    /// Restage a throttled subscribe once its backoff expires.
    fn schedule_retry(&self, deferred: DeferredSubscribe) {
        let delay = self.inner.config.retry_backoff(deferred.attempt);
        debug!(handle = ?deferred.handle, attempt = deferred.attempt, ?delay, "scheduling subscribe retry");

        let weak = Arc::downgrade(&self.inner);
        self.inner.io_queue.submit_after(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    RtaEngine { inner }.restage(deferred.handle);
                }
            }),
        );
    }

    fn restage(&self, handle: SubscriptionHandle) {
        match self.with_state(|state| state.registry.restage_subscribe(handle)) {
            Ok(true) => self.schedule_flush(),
            Ok(false) => debug!(?handle, "subscription gone before retry"),
            Err(error) => warn!(%error, ?handle, "cannot retry subscribe"),
        }
    }

    // --- Handlers ---

    /// Register for connection state changes. If the engine is not
    /// disconnected the handler is immediately told the current state.
    pub fn add_connection_state_handler<F>(&self, handler: F) -> RegistrationToken
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let handler: crate::types::ConnectionStateHandler = Arc::new(handler);
        let (token, _) = self.inner.shared.with_then(
            |state| {
                let token = state
                    .dispatcher
                    .add_connection_state_handler(Arc::clone(&handler));
                let current = state.connection;
                let catch_up = (current != ConnectionState::Disconnected).then(|| {
                    Notification::ConnectionState {
                        handlers: vec![Arc::clone(&handler)],
                        state: current,
                    }
                });
                (token, catch_up)
            },
            |(_, catch_up)| self.deliver(catch_up.take()),
        );
        token
    }

    pub fn remove_connection_state_handler(&self, token: RegistrationToken) {
        self.with_state(|state| state.dispatcher.remove_connection_state_handler(token));
    }

    /// Register for every subscription failure, after the owning
    /// subscription's own callback.
    pub fn add_subscription_error_handler<F>(&self, handler: F) -> RegistrationToken
    where
        F: Fn(&SubscriptionErrorEvent) + Send + Sync + 'static,
    {
        self.with_state(|state| {
            state
                .dispatcher
                .add_subscription_error_handler(Arc::new(handler))
        })
    }

    pub fn remove_subscription_error_handler(&self, token: RegistrationToken) {
        self.with_state(|state| state.dispatcher.remove_subscription_error_handler(token));
    }

    /// Register for resync requests. Fired after every disconnect and when
    /// the service asks for one.
    pub fn add_resync_handler<F>(&self, handler: F) -> RegistrationToken
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.with_state(|state| state.dispatcher.add_resync_handler(Arc::new(handler)))
    }

    pub fn remove_resync_handler(&self, token: RegistrationToken) {
        self.with_state(|state| state.dispatcher.remove_resync_handler(token));
    }

    // --- Transport entry points ---

    pub fn on_connecting(&self) {
        self.inner.controller.on_connecting(&self.inner.shared);
    }

    pub fn on_connected(&self) {
        self.inner.controller.on_connected(&self.inner.shared);
    }

    pub fn on_disconnected(&self) {
        self.inner.controller.on_disconnected(&self.inner.shared);
    }

    pub fn on_frame_received(&self, frame: &str) {
        let deferred = self
            .inner
            .controller
            .on_frame_received(&self.inner.shared, frame);
        if let Some(deferred) = deferred {
            self.schedule_retry(deferred);
        }
    }
}

/// Non-owning reference to an [`RtaEngine`].
#[derive(Clone, Default)]
pub struct WeakRtaEngine {
    inner: Weak<EngineInner>,
}

impl WeakRtaEngine {
    pub fn upgrade(&self) -> Option<RtaEngine> {
        self.inner.upgrade().map(|inner| RtaEngine { inner })
    }
}
