//! Error types for the RTA multiplexer.

use crate::types::{RtaErrorCode, SequenceNumber};
use thiserror::Error;

/// Failure to interpret an inbound frame.
///
/// Always recovered locally: the frame is logged and dropped.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(u64),
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Malformed(e.to_string())
    }
}

/// Bookkeeping errors raised by the subscription registry.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("No request awaiting acknowledgement for sequence number {0}")]
    UnknownSequenceNumber(SequenceNumber),

    #[error("Unsubscribe already pending for this subscription")]
    AlreadyPendingUnsubscribe,

    #[error("Sequence numbers exhausted")]
    SequenceExhausted,
}

/// Transport-level failures reported by a [`Transport`](crate::Transport).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,

    #[error("Transport is closed")]
    Closed,

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Send failed: {0}")]
    Send(String),
}

/// Why a subscription failed. Delivered to error handlers, never returned.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("Connection to the RTA service was lost")]
    ConnectionLost,

    #[error("Subscription rejected by service ({code:?}): {message}")]
    Rejected { code: RtaErrorCode, message: String },
}

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum RtaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, RtaError>;
