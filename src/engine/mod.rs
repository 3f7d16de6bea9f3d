//! The non-blocking connection engine.
//!
//! Shared pieces of both roles:
//! - `connection`: per-socket framing state machines and outbound queue
//! - `registry`: slab arena mapping poll tokens to connections
//! - `event_loop`: the readiness loop and its cross-thread handle

pub(crate) mod connection;
pub(crate) mod event_loop;
pub(crate) mod registry;

pub use connection::ConnectionHandle;
pub(crate) use connection::Lifecycle;
