//! The single transport session shared by every subscription.
//!
//! A [`Transport`] moves frames; the controller turns its lifecycle events
//! and inbound frames into registry transitions and callback deliveries.

mod controller;
mod transport;

pub(crate) use controller::ConnectionController;
pub use transport::{MemoryTransport, Transport};
