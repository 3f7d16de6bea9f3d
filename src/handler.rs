//! The event sink contract between the engine and application code.
//!
//! An [`EventHandler`] receives fully-assembled inbound frames and may
//! answer each with a [`Reply`]. One handler instance is shared across
//! all connections a role owns, so implementations must be `Send + Sync`;
//! the engine invokes `on_read` from the loop thread only.

use crate::engine::ConnectionHandle;
use crate::error::EngineError;
use bytes::Bytes;

/// Optional response to an inbound frame.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Whether `bytes` should be written back on the same connection.
    pub write_back: bool,
    /// Payload to write back when `write_back` is set.
    pub bytes: Bytes,
}

impl Reply {
    /// Reply with a payload to be written back to the peer.
    pub fn write_back(bytes: impl Into<Bytes>) -> Self {
        Self {
            write_back: true,
            bytes: bytes.into(),
        }
    }

    /// No reply.
    pub fn none() -> Self {
        Self {
            write_back: false,
            bytes: Bytes::new(),
        }
    }
}

/// Application callbacks driven by the readiness loop.
///
/// All callbacks run on the loop thread; blocking inside them stalls
/// every connection that loop owns.
pub trait EventHandler: Send + Sync {
    /// Called with each complete inbound payload, in wire order.
    fn on_read(&self, payload: Bytes) -> Reply;

    /// Called once the connection is usable for writes.
    ///
    /// The handle may be cloned and handed to producer threads; frames
    /// enqueued through it are transmitted in enqueue order.
    fn on_active(&self, _conn: ConnectionHandle) {}

    /// Called on any I/O or protocol fault, before the connection's
    /// resources are released.
    fn on_exception(&self, _error: &EngineError) {}
}
