//! Engine configuration.
//!
//! Tunables can be built in code via [`EngineConfig::default`] or loaded
//! from a TOML file. Every field has a default so a partial file is fine.

use serde::Deserialize;
use std::path::Path;

use crate::error::EngineError;

/// Resolved engine tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Maximum simultaneously tracked connections per event loop.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum accepted frame payload length in bytes. A header
    /// declaring more than this is a protocol error and closes the
    /// connection.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Number of event loops a server spreads accepted connections
    /// over. 1 keeps everything on a single readiness loop. Ignored by
    /// the client, which always runs exactly one loop.
    #[serde(default = "default_event_loops")]
    pub event_loops: usize,

    /// Capacity of the readiness event batch per poll wakeup.
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_frame_len() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_event_loops() -> usize {
    1
}

fn default_events_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_frame_len: default_max_frame_len(),
            event_loops: default_event_loops(),
            events_capacity: default_events_capacity(),
        }
    }
}

impl EngineConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        toml::from_str(contents).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}
