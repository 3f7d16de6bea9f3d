//! Error types for the engine.
//!
//! The taxonomy follows the transport/protocol split: transport errors
//! come from the socket, protocol errors from a corrupted frame stream.
//! Neither is retried at this layer; retry policy belongs to the caller.

use std::io;
use thiserror::Error;

/// Main error type for all engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Declared frame length exceeds the configured limit.
    ///
    /// The stream is considered corrupted; no resynchronization is
    /// attempted and the connection is closed.
    #[error("declared frame length {declared} exceeds limit {max}")]
    FrameTooLarge { declared: u64, max: usize },

    /// Non-blocking connect did not complete.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Accepted connection dropped because the registry is full.
    #[error("connection limit reached")]
    AtCapacity,

    /// Configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(String),
}

/// Result type alias using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Whether this error originated below the framing layer.
    pub fn is_transport(&self) -> bool {
        matches!(self, EngineError::Io(_) | EngineError::ConnectionClosed)
    }
}
