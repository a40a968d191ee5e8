//! Subscription entities and staging requests.

use crate::codec::MessageType;
use crate::types::{
    ChangeHandler, SequenceNumber, SubscribedHandler, SubscriptionErrorHandler,
    SubscriptionHandle, SubscriptionId, SubscriptionState,
};
use std::fmt;
use std::sync::Arc;

/// What the application wants to watch, and who to tell about it.
#[derive(Clone)]
pub struct SubscriptionRequest {
    pub resource_uri: String,
    pub on_change: ChangeHandler,
    pub on_error: SubscriptionErrorHandler,
    pub on_subscribed: Option<SubscribedHandler>,
}

impl SubscriptionRequest {
    pub fn new<C, E>(resource_uri: impl Into<String>, on_change: C, on_error: E) -> Self
    where
        C: Fn(&crate::types::ChangeEvent) + Send + Sync + 'static,
        E: Fn(&crate::types::SubscriptionErrorEvent) + Send + Sync + 'static,
    {
        Self {
            resource_uri: resource_uri.into(),
            on_change: Arc::new(on_change),
            on_error: Arc::new(on_error),
            on_subscribed: None,
        }
    }

    /// Receive the initial resource payload sent with the subscribe ack.
    pub fn with_subscribed_handler<S>(mut self, on_subscribed: S) -> Self
    where
        S: Fn(&crate::types::SubscribedEvent) + Send + Sync + 'static,
    {
        self.on_subscribed = Some(Arc::new(on_subscribed));
        self
    }
}

impl fmt::Debug for SubscriptionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRequest")
            .field("resource_uri", &self.resource_uri)
            .field("on_subscribed", &self.on_subscribed.is_some())
            .finish_non_exhaustive()
    }
}

/// One client interest in a named resource. Owned by the registry.
pub struct Subscription {
    pub(crate) handle: SubscriptionHandle,
    pub(crate) resource_uri: String,
    pub(crate) state: SubscriptionState,
    /// The single outstanding correlation, if any.
    pub(crate) sequence_number: Option<SequenceNumber>,
    pub(crate) subscription_id: Option<SubscriptionId>,
    /// Written to the transport (as opposed to still queued).
    pub(crate) submitted: bool,
    /// Unsubscribe requested while the subscribe was in flight.
    pub(crate) cancel_on_ack: bool,
    /// Set once by `stage_unsubscribe`; survives closing.
    pub(crate) unsubscribe_requested: bool,
    /// Subscribe attempts the service turned away as throttled.
    pub(crate) throttled_attempts: u32,
    pub(crate) on_change: ChangeHandler,
    pub(crate) on_error: SubscriptionErrorHandler,
    pub(crate) on_subscribed: Option<SubscribedHandler>,
}

impl Subscription {
    pub(crate) fn from_request(
        handle: SubscriptionHandle,
        sequence_number: SequenceNumber,
        request: SubscriptionRequest,
    ) -> Self {
        Self {
            handle,
            resource_uri: request.resource_uri,
            state: SubscriptionState::PendingSubscribe,
            sequence_number: Some(sequence_number),
            subscription_id: None,
            submitted: false,
            cancel_on_ack: false,
            unsubscribe_requested: false,
            throttled_attempts: 0,
            on_change: request.on_change,
            on_error: request.on_error,
            on_subscribed: request.on_subscribed,
        }
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    pub fn resource_uri(&self) -> &str {
        &self.resource_uri
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn sequence_number(&self) -> Option<SequenceNumber> {
        self.sequence_number
    }

    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.subscription_id
    }

    pub fn error_handler(&self) -> SubscriptionErrorHandler {
        Arc::clone(&self.on_error)
    }

    /// Whether the application already asked for this subscription to go away.
    pub fn teardown_requested(&self) -> bool {
        self.unsubscribe_requested
    }

    pub(crate) fn close(&mut self) {
        self.state = SubscriptionState::Closed;
        self.sequence_number = None;
        self.subscription_id = None;
        self.submitted = false;
        self.cancel_on_ack = false;
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("handle", &self.handle)
            .field("resource_uri", &self.resource_uri)
            .field("state", &self.state)
            .field("sequence_number", &self.sequence_number)
            .field("subscription_id", &self.subscription_id)
            .field("submitted", &self.submitted)
            .field("cancel_on_ack", &self.cancel_on_ack)
            .field("unsubscribe_requested", &self.unsubscribe_requested)
            .field("throttled_attempts", &self.throttled_attempts)
            .finish()
    }
}

/// A throttled subscribe parked until its backoff expires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeferredSubscribe {
    pub handle: SubscriptionHandle,
    /// Earlier throttled attempts, starting at 0.
    pub attempt: u32,
}

/// Request body of a staged submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmissionTarget {
    Subscribe { resource_uri: String },
    Unsubscribe { subscription_id: SubscriptionId },
}

/// One entry of the pending-submission queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingSubmission {
    pub sequence_number: SequenceNumber,
    pub handle: SubscriptionHandle,
    pub target: SubmissionTarget,
}

impl PendingSubmission {
    pub fn message_type(&self) -> MessageType {
        match self.target {
            SubmissionTarget::Subscribe { .. } => MessageType::Subscribe,
            SubmissionTarget::Unsubscribe { .. } => MessageType::Unsubscribe,
        }
    }

    /// Wire frame for this submission.
    pub fn encode(&self) -> String {
        match &self.target {
            SubmissionTarget::Subscribe { resource_uri } => {
                crate::codec::encode_subscribe(self.sequence_number, resource_uri)
            }
            SubmissionTarget::Unsubscribe { subscription_id } => {
                crate::codec::encode_unsubscribe(self.sequence_number, *subscription_id)
            }
        }
    }
}
