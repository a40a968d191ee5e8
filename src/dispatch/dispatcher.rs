//! Handler registries and notification delivery.

use crate::types::{
    ChangeEvent, ChangeHandler, ConnectionState, ConnectionStateHandler, RegistrationToken,
    ResyncHandler, SubscribedEvent, SubscribedHandler, SubscriptionErrorEvent,
    SubscriptionErrorHandler,
};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{trace, warn};

use super::queue::TaskQueue;

/// Handlers of one kind, ordered by registration.
struct HandlerTable<H> {
    handlers: BTreeMap<RegistrationToken, H>,
}

impl<H: Clone> HandlerTable<H> {
    fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    fn insert(&mut self, token: RegistrationToken, handler: H) {
        self.handlers.insert(token, handler);
    }

    fn remove(&mut self, token: RegistrationToken) -> bool {
        self.handlers.remove(&token).is_some()
    }

    /// Copy taken before a delivery pass, so handlers may add or remove
    /// handlers from inside their callback.
    fn snapshot(&self) -> Vec<H> {
        self.handlers.values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.handlers.len()
    }
}

/// Registries for the three global handler kinds.
///
/// One token counter is shared by all kinds; tokens are never reused.
pub struct EventDispatcher {
    next_token: u64,
    connection_state: HandlerTable<ConnectionStateHandler>,
    subscription_error: HandlerTable<SubscriptionErrorHandler>,
    resync: HandlerTable<ResyncHandler>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            next_token: 1,
            connection_state: HandlerTable::new(),
            subscription_error: HandlerTable::new(),
            resync: HandlerTable::new(),
        }
    }

    fn next_token(&mut self) -> RegistrationToken {
        let token = RegistrationToken(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn add_connection_state_handler(
        &mut self,
        handler: ConnectionStateHandler,
    ) -> RegistrationToken {
        let token = self.next_token();
        self.connection_state.insert(token, handler);
        token
    }

    /// Returns whether a handler was removed. Unknown tokens are ignored.
    pub fn remove_connection_state_handler(&mut self, token: RegistrationToken) -> bool {
        self.connection_state.remove(token)
    }

    pub fn add_subscription_error_handler(
        &mut self,
        handler: SubscriptionErrorHandler,
    ) -> RegistrationToken {
        let token = self.next_token();
        self.subscription_error.insert(token, handler);
        token
    }

    pub fn remove_subscription_error_handler(&mut self, token: RegistrationToken) -> bool {
        self.subscription_error.remove(token)
    }

    pub fn add_resync_handler(&mut self, handler: ResyncHandler) -> RegistrationToken {
        let token = self.next_token();
        self.resync.insert(token, handler);
        token
    }

    pub fn remove_resync_handler(&mut self, token: RegistrationToken) -> bool {
        self.resync.remove(token)
    }

    pub fn handler_count(&self) -> usize {
        self.connection_state.len() + self.subscription_error.len() + self.resync.len()
    }

    // --- Notifications ---

    pub fn connection_state_notification(&self, state: ConnectionState) -> Notification {
        Notification::ConnectionState {
            handlers: self.connection_state.snapshot(),
            state,
        }
    }

    /// The owning subscription's callback runs first, then every global
    /// handler in registration order.
    pub fn subscription_error_notification(
        &self,
        owner: SubscriptionErrorHandler,
        event: SubscriptionErrorEvent,
    ) -> Notification {
        let mut handlers = Vec::with_capacity(self.subscription_error.len() + 1);
        handlers.push(owner);
        handlers.extend(self.subscription_error.snapshot());
        Notification::SubscriptionError { handlers, event }
    }

    pub fn resync_notification(&self) -> Notification {
        Notification::Resync {
            handlers: self.resync.snapshot(),
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// A delivery pass: the handlers to call and what to call them with.
///
/// Built under the engine lock, delivered after it is released.
pub enum Notification {
    ConnectionState {
        handlers: Vec<ConnectionStateHandler>,
        state: ConnectionState,
    },
    SubscriptionError {
        handlers: Vec<SubscriptionErrorHandler>,
        event: SubscriptionErrorEvent,
    },
    Resync {
        handlers: Vec<ResyncHandler>,
    },
    Change {
        handler: ChangeHandler,
        event: ChangeEvent,
    },
    Subscribed {
        handler: SubscribedHandler,
        event: SubscribedEvent,
    },
}

impl Notification {
    /// Invoke every handler in order. A panicking handler is logged and
    /// skipped; the rest still run.
    pub fn run(self) {
        match self {
            Notification::ConnectionState { handlers, state } => {
                trace!(?state, count = handlers.len(), "delivering connection state");
                for handler in handlers {
                    guarded("connection state", || handler(state));
                }
            }
            Notification::SubscriptionError { handlers, event } => {
                trace!(handle = ?event.handle, error = %event.error, "delivering subscription error");
                for handler in handlers {
                    guarded("subscription error", || handler(&event));
                }
            }
            Notification::Resync { handlers } => {
                trace!(count = handlers.len(), "delivering resync");
                for handler in handlers {
                    guarded("resync", || handler());
                }
            }
            Notification::Change { handler, event } => {
                guarded("change", || handler(&event));
            }
            Notification::Subscribed { handler, event } => {
                guarded("subscribed", || handler(&event));
            }
        }
    }

    /// Hand this pass to `queue` as a single task.
    pub fn dispatch(self, queue: &dyn TaskQueue) {
        queue.submit(Box::new(move || self.run()));
    }
}

fn guarded(kind: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(kind, "handler panicked");
    }
}
