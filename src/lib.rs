//! netframe: an event-driven socket engine with symmetric client and
//! server roles over a length-prefixed frame protocol.
//!
//! Every message on the wire is a 4-byte big-endian length followed by
//! that many opaque payload bytes. The engine moves byte sequences only;
//! serialization of payloads belongs to the application.
//!
//! One dedicated thread drives the readiness loop for a client
//! connection or for a server's accepted-connection set. That thread
//! performs all non-blocking socket I/O and all connection-state
//! mutation; application threads interact only through the thread-safe
//! enqueue on a [`ConnectionHandle`] and the client's connect status.
//!
//! ```no_run
//! use netframe::{Client, EngineConfig, EventHandler, Reply, Server};
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! struct Pong;
//! impl EventHandler for Pong {
//!     fn on_read(&self, payload: Bytes) -> Reply {
//!         Reply::write_back(payload) // echo
//!     }
//! }
//!
//! struct Print;
//! impl EventHandler for Print {
//!     fn on_read(&self, payload: Bytes) -> Reply {
//!         println!("got {} bytes", payload.len());
//!         Reply::none()
//!     }
//! }
//!
//! # fn main() -> netframe::Result<()> {
//! let addr = "127.0.0.1:8888".parse().unwrap();
//! let _server = Server::startup(addr, Arc::new(Pong), EngineConfig::default())?;
//! let client = Client::startup(addr, Arc::new(Print), EngineConfig::default())?;
//! client.await_connected()?;
//! client.write_to_server(Bytes::from_static(b"ping"));
//! # Ok(())
//! # }
//! ```

pub mod codec;
mod client;
mod config;
mod engine;
mod error;
mod handler;
mod server;

pub use client::{Client, ConnectStatus};
pub use config::EngineConfig;
pub use engine::ConnectionHandle;
pub use error::{EngineError, Result};
pub use handler::{EventHandler, Reply};
pub use server::Server;
