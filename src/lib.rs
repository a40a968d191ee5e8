//! # RTA Multiplexer
//!
//! Client-side multiplexer for Real-Time Activity (RTA) subscriptions. Many
//! application-level subscriptions share one websocket-style connection to
//! the RTA service.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: interest in a resource URI, correlated with the
//!   service by client sequence numbers and routed by server subscription ids
//! - **Transport**: the byte pipe; it reports lifecycle and inbound frames
//!   back to the engine
//! - **Dispatch**: callbacks are delivered on a task queue, never under the
//!   engine lock
//! - **Resync**: after a disconnect, or on request from the service,
//!   applications re-establish what they need
//!
//! ## Example
//!
//! ```ignore
//! use rta_mux::{EngineConfig, MemoryTransport, RtaEngine};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(MemoryTransport::new());
//! let engine = RtaEngine::new(transport.clone(), EngineConfig::default())?;
//!
//! let handle = engine.subscribe(
//!     "https://presence.example/users/42/devices",
//!     |change| println!("changed: {}", change.data),
//!     |failure| eprintln!("failed: {}", failure.error),
//! )?;
//!
//! engine.activate()?;
//! // ...the transport calls engine.on_connected(), engine.on_frame_received(..)
//!
//! engine.unsubscribe(handle)?;
//! ```

pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use codec::{DecodedMessage, InboundMessage, MessageType};
pub use connection::{MemoryTransport, Transport};
pub use dispatch::{EventDispatcher, InlineQueue, Task, TaskQueue, WorkerQueue};
pub use engine::{DispatchMode, EngineConfig, RtaEngine, WeakRtaEngine};
pub use error::{
    CodecError, RegistryError, Result, RtaError, SubscriptionError, TransportError,
};
pub use subscriptions::{SubscriptionRegistry, SubscriptionRequest};
pub use types::{
    ChangeEvent, ConnectionState, RegistrationToken, RtaErrorCode, SequenceNumber,
    SubscribedEvent, SubscriptionErrorEvent, SubscriptionHandle, SubscriptionId,
    SubscriptionState,
};
