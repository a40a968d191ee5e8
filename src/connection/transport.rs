//! The byte-pipe abstraction the engine writes frames to.

use crate::error::TransportError;
use parking_lot::Mutex;
use tracing::debug;

/// A bidirectional, message-oriented channel to the RTA service.
///
/// Outbound traffic goes through [`send`](Transport::send). Inbound traffic
/// and lifecycle changes are reported by the transport calling the engine's
/// `on_*` entry points, from any thread.
///
/// `send` must not block on the network and must not call back into the
/// engine before returning.
pub trait Transport: Send + Sync {
    /// Begin connecting. Completion is reported through `on_connected` or
    /// `on_disconnected`.
    fn connect(&self) -> Result<(), TransportError>;

    /// Queue one text frame for transmission.
    fn send(&self, frame: &str) -> Result<(), TransportError>;

    /// Tear the session down. Must be safe to call when already closed.
    fn close(&self);
}

#[derive(Default)]
struct MemoryState {
    open: bool,
    fail_connect: bool,
    failing_sends: usize,
    sent: Vec<String>,
    connect_calls: usize,
    close_calls: usize,
}

/// In-process transport that records every frame it is given.
///
/// `connect` marks the pipe open immediately; the host still reports
/// `on_connected` to the engine itself. Failures can be scripted.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames sent so far, oldest first.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Frames sent since the last call.
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().sent)
    }

    /// Reject the next `count` sends with [`TransportError::Send`].
    pub fn fail_next_sends(&self, count: usize) {
        self.state.lock().failing_sends = count;
    }

    /// Make `connect` fail until reset.
    pub fn fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    /// Mark the pipe open or closed without going through `connect`.
    pub fn set_open(&self, open: bool) {
        self.state.lock().open = open;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }
}

impl Transport for MemoryTransport {
    fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.connect_calls += 1;
        if state.fail_connect {
            return Err(TransportError::Connect("scripted connect failure".into()));
        }
        state.open = true;
        Ok(())
    }

    fn send(&self, frame: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::NotConnected);
        }
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(TransportError::Send("scripted send failure".into()));
        }
        debug!(len = frame.len(), "memory transport accepted frame");
        state.sent.push(frame.to_string());
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.close_calls += 1;
        state.open = false;
    }
}
