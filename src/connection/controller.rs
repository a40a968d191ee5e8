//! Connection lifecycle and inbound frame handling.

use crate::codec::{self, InboundMessage};
use crate::dispatch::{Notification, TaskQueue};
use crate::engine::{EngineConfig, EngineState, SharedState};
use crate::error::SubscriptionError;
use crate::subscriptions::{DeferredSubscribe, Subscription};
use crate::types::{ConnectionState, SubscribedEvent, SubscriptionErrorEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::transport::Transport;

/// Drives the registry from transport events and writes staged work out.
///
/// Holds no subscription state of its own; every call takes the engine's
/// shared state and locks it only around bookkeeping.
pub(crate) struct ConnectionController {
    transport: Arc<dyn Transport>,
    callback_queue: Arc<dyn TaskQueue>,
    /// Held for a whole flush pass so frames leave in staging order.
    send_lock: Mutex<()>,
    max_frame_bytes: usize,
    log_frames: bool,
}

impl ConnectionController {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        callback_queue: Arc<dyn TaskQueue>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            transport,
            callback_queue,
            send_lock: Mutex::new(()),
            max_frame_bytes: config.max_frame_bytes,
            log_frames: config.log_frames,
        }
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Hand notifications to the callback queue, in order.
    pub(crate) fn deliver(&self, notifications: impl IntoIterator<Item = Notification>) {
        for notification in notifications {
            notification.dispatch(self.callback_queue.as_ref());
        }
    }

    pub(crate) fn on_connecting(&self, shared: &SharedState) {
        let notification = shared.with(|state| {
            if !state.active {
                debug!("inactive, ignoring connecting");
                return None;
            }
            if state.connection == ConnectionState::Connecting {
                return None;
            }
            debug!(from = ?state.connection, "connecting");
            state.connection = ConnectionState::Connecting;
            Some(
                state
                    .dispatcher
                    .connection_state_notification(ConnectionState::Connecting),
            )
        });
        self.deliver(notification);
    }

    pub(crate) fn on_connected(&self, shared: &SharedState) {
        let notification = shared.with(|state| {
            if !state.active {
                debug!("inactive, ignoring connected");
                return None;
            }
            if state.connection == ConnectionState::Connected {
                return None;
            }
            debug!(
                pending = state.registry.pending_submission_count(),
                "connected"
            );
            state.connection = ConnectionState::Connected;
            Some(
                state
                    .dispatcher
                    .connection_state_notification(ConnectionState::Connected),
            )
        });

        if let Some(notification) = notification {
            self.flush(shared);
            self.deliver(Some(notification));
        }
    }

    /// Fail every live subscription and announce the disconnect.
    ///
    /// Nothing is resubscribed; applications react to the resync
    /// notification.
    pub(crate) fn on_disconnected(&self, shared: &SharedState) {
        let notifications = shared.with(|state| {
            if state.connection == ConnectionState::Disconnected {
                debug!("already disconnected");
                return Vec::new();
            }
            state.connection = ConnectionState::Disconnected;
            state.end_session();

            let closed = state.registry.clear_all();
            debug!(closed = closed.len(), "disconnected");

            let mut notifications = Vec::with_capacity(closed.len() + 2);
            for sub in &closed {
                notifications.push(error_notification(
                    state,
                    sub,
                    SubscriptionError::ConnectionLost,
                ));
            }
            notifications.push(
                state
                    .dispatcher
                    .connection_state_notification(ConnectionState::Disconnected),
            );
            notifications.push(state.dispatcher.resync_notification());
            notifications
        });
        self.deliver(notifications);
    }

    /// Decode and apply one inbound frame. Bad frames are logged and dropped.
    ///
    /// A throttled subscribe comes back as a [`DeferredSubscribe`] for the
    /// caller to restage after a backoff.
    pub(crate) fn on_frame_received(
        &self,
        shared: &SharedState,
        frame: &str,
    ) -> Option<DeferredSubscribe> {
        if frame.len() > self.max_frame_bytes {
            warn!(
                len = frame.len(),
                limit = self.max_frame_bytes,
                "dropping oversized frame"
            );
            return None;
        }
        if self.log_frames {
            trace!(%frame, "received");
        }

        let message = match codec::decode_inbound(frame) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "dropping malformed frame");
                return None;
            }
        };

        let (notification, deferred, needs_flush) = shared.with(|state| {
            if !state.active {
                debug!("inactive, ignoring frame");
                return (None, None, false);
            }
            let (notification, deferred) = apply(state, message);
            let needs_flush = state.connection == ConnectionState::Connected
                && state.registry.pending_submission_count() > 0;
            (notification, deferred, needs_flush)
        });

        self.deliver(notification);
        if needs_flush {
            self.flush(shared);
        }
        deferred
    }

    /// Write every pending submission to the transport.
    ///
    /// On a send failure the failed item and everything after it go back to
    /// the head of the queue and the pass stops; they are retried on the
    /// next flush. If the session ends mid-pass the rest of the batch is
    /// dropped: it belonged to subscriptions that are now closed.
    pub(crate) fn flush(&self, shared: &SharedState) {
        let _send = self.send_lock.lock();

        let (session, batch) = shared.with(|state| {
            if !state.active || state.connection != ConnectionState::Connected {
                return (state.session, Vec::new());
            }
            (state.session, state.registry.drain_pending_submissions())
        });

        for (index, item) in batch.iter().enumerate() {
            let current = shared.with(|state| {
                if state.session != session {
                    return None;
                }
                Some(
                    state
                        .registry
                        .get(item.handle)
                        .map_or(false, |sub| sub.sequence_number() == Some(item.sequence_number)),
                )
            });
            match current {
                None => {
                    debug!(unsent = batch.len() - index, "session ended mid-flush");
                    return;
                }
                Some(false) => {
                    trace!(seq = %item.sequence_number, "skipping stale submission");
                    continue;
                }
                Some(true) => {}
            }

            let frame = item.encode();
            if self.log_frames {
                trace!(%frame, "sending");
            }
            if let Err(error) = self.transport.send(&frame) {
                warn!(
                    %error,
                    seq = %item.sequence_number,
                    unsent = batch.len() - index,
                    "send failed, requeueing"
                );
                let unsent = batch[index..].to_vec();
                shared.with(|state| state.registry.requeue_front(unsent));
                return;
            }
            debug!(seq = %item.sequence_number, kind = ?item.message_type(), "sent");
        }
    }
}

fn apply(
    state: &mut EngineState,
    message: InboundMessage,
) -> (Option<Notification>, Option<DeferredSubscribe>) {
    if let InboundMessage::SubscribeRejected {
        sequence_number,
        code,
        ..
    } = &message
    {
        if code.is_retryable() {
            match state.registry.defer_subscribe(*sequence_number) {
                Ok(Some(deferred)) => {
                    debug!(seq = %sequence_number, ?code, attempt = deferred.attempt, "subscribe throttled");
                    return (None, Some(deferred));
                }
                // Being cancelled; close it like any other rejection.
                Ok(None) => {}
                Err(error) => {
                    warn!(%error, "ignoring subscribe rejection");
                    return (None, None);
                }
            }
        }
    }
    (settle(state, message), None)
}

fn settle(state: &mut EngineState, message: InboundMessage) -> Option<Notification> {
    match message {
        InboundMessage::SubscribeAccepted {
            sequence_number,
            subscription_id,
            data,
        } => {
            if let Err(error) = state
                .registry
                .complete_subscribe(sequence_number, subscription_id)
            {
                warn!(%error, "ignoring subscribe ack");
                return None;
            }
            state
                .registry
                .subscribed_handler(subscription_id)
                .map(|(handle, handler)| Notification::Subscribed {
                    handler,
                    event: SubscribedEvent {
                        handle,
                        subscription_id,
                        data,
                    },
                })
        }
        InboundMessage::SubscribeRejected {
            sequence_number,
            code,
            message,
        } => {
            let error = SubscriptionError::Rejected { code, message };
            match state
                .registry
                .complete_subscribe_error(sequence_number, &error)
            {
                Ok(sub) => Some(error_notification(state, &sub, error)),
                Err(skew) => {
                    warn!(error = %skew, "ignoring subscribe rejection");
                    None
                }
            }
        }
        InboundMessage::UnsubscribeAck {
            sequence_number,
            code,
        } => {
            if !code.is_success() {
                warn!(seq = %sequence_number, ?code, "unsubscribe acknowledged with error");
            }
            if let Err(error) = state.registry.complete_unsubscribe(sequence_number) {
                warn!(%error, "ignoring unsubscribe ack");
            }
            None
        }
        InboundMessage::Change(event) => {
            match state.registry.route_change_event(event.subscription_id) {
                Some(handler) => Some(Notification::Change { handler, event }),
                None => {
                    trace!(subscription_id = %event.subscription_id, "no subscriber, dropping change");
                    None
                }
            }
        }
        InboundMessage::Resync => {
            debug!("service requested resync");
            Some(state.dispatcher.resync_notification())
        }
    }
}

fn error_notification(
    state: &EngineState,
    sub: &Subscription,
    error: SubscriptionError,
) -> Notification {
    state.dispatcher.subscription_error_notification(
        sub.error_handler(),
        SubscriptionErrorEvent {
            handle: sub.handle(),
            resource_uri: sub.resource_uri().to_string(),
            error,
        },
    )
}
