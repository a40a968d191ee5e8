//! Callback delivery.
//!
//! Global handlers live in an [`EventDispatcher`]. Deliveries are packaged as
//! [`Notification`]s while the engine lock is held and then handed to a
//! [`TaskQueue`] once it is released, so handlers never run under the lock and
//! are free to call back into the engine.

mod dispatcher;
mod queue;

pub use dispatcher::{EventDispatcher, Notification};
pub use queue::{InlineQueue, Task, TaskQueue, WorkerQueue};
