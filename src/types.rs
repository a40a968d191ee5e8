//! Core types shared by the multiplexer components.

use crate::error::SubscriptionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Client-assigned number correlating a subscribe/unsubscribe request with its
/// acknowledgement. Carried on the wire as a `u32`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u32);

impl SequenceNumber {
    /// The number after this one, or `None` once the wire range is exhausted.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(SequenceNumber)
    }
}

impl fmt::Debug for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned subscription id, used to route change events.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u32);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque, non-owning handle naming a subscription.
///
/// Handles are allocated from a per-engine counter and never reused, so a
/// handle outliving its subscription simply stops resolving.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionHandle(pub(crate) u64);

impl SubscriptionHandle {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionHandle({})", self.0)
    }
}

/// Token returned by every `add_*_handler` call; used only for removal.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegistrationToken(pub(crate) u64);

impl fmt::Debug for RegistrationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.0)
    }
}

/// State of the single transport session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Lifecycle state of one subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Staged or sent, waiting for the subscribe acknowledgement.
    PendingSubscribe,
    /// Acknowledged; change events are routed to the owner.
    Subscribed,
    /// Unsubscribe staged or sent, waiting for the acknowledgement.
    PendingUnsubscribe,
    /// Terminal.
    Closed,
}

/// Status codes carried by RTA acknowledgements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RtaErrorCode {
    Success,
    UnknownResource,
    SubscriptionLimitReached,
    NoResourceData,
    Throttled,
    ServiceUnavailable,
    Other(u32),
}

impl RtaErrorCode {
    pub fn from_wire(code: u32) -> Self {
        match code {
            0 => RtaErrorCode::Success,
            1 => RtaErrorCode::UnknownResource,
            2 => RtaErrorCode::SubscriptionLimitReached,
            3 => RtaErrorCode::NoResourceData,
            1001 => RtaErrorCode::Throttled,
            1002 => RtaErrorCode::ServiceUnavailable,
            other => RtaErrorCode::Other(other),
        }
    }

    pub fn as_wire(self) -> u32 {
        match self {
            RtaErrorCode::Success => 0,
            RtaErrorCode::UnknownResource => 1,
            RtaErrorCode::SubscriptionLimitReached => 2,
            RtaErrorCode::NoResourceData => 3,
            RtaErrorCode::Throttled => 1001,
            RtaErrorCode::ServiceUnavailable => 1002,
            RtaErrorCode::Other(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == RtaErrorCode::Success
    }

    /// The service is shedding load; the request may succeed later.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            RtaErrorCode::Throttled | RtaErrorCode::ServiceUnavailable
        )
    }
}

/// A change notification for one subscribed resource.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    pub subscription_id: SubscriptionId,
    /// Resource-specific payload, passed through untouched.
    pub data: serde_json::Value,
}

/// Payload delivered when the service acknowledges a subscribe request.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscribedEvent {
    pub handle: SubscriptionHandle,
    pub subscription_id: SubscriptionId,
    /// Initial resource state sent with the acknowledgement (may be null).
    pub data: serde_json::Value,
}

/// A subscription-level failure, as seen by error handlers.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionErrorEvent {
    pub handle: SubscriptionHandle,
    pub resource_uri: String,
    pub error: SubscriptionError,
}

pub type ChangeHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
pub type SubscribedHandler = Arc<dyn Fn(&SubscribedEvent) + Send + Sync>;
pub type SubscriptionErrorHandler = Arc<dyn Fn(&SubscriptionErrorEvent) + Send + Sync>;
pub type ConnectionStateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;
pub type ResyncHandler = Arc<dyn Fn() + Send + Sync>;
