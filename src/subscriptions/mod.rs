//! Subscription bookkeeping.
//!
//! The registry is the only place subscription state changes. Each
//! subscription moves through:
//!
//! ```text
//! PendingSubscribe --(ack, id)--> Subscribed --(unsubscribe)--> PendingUnsubscribe --(ack)--> Closed
//! PendingSubscribe --(rejected)------------------------------------------------------------> Closed
//! any live state --(connection lost)---------------------------------------------------------> Closed
//! ```
//!
//! A subscribe turned away as throttled stays `PendingSubscribe`, parked
//! without a sequence number until it is restaged after a backoff.
//!
//! Requests are correlated with acknowledgements strictly by sequence number;
//! change events are routed by the server-assigned subscription id.

mod registry;
mod types;

pub use registry::SubscriptionRegistry;
pub use types::{
    DeferredSubscribe, PendingSubmission, SubmissionTarget, Subscription, SubscriptionRequest,
};
