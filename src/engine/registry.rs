//! Slab-backed registry of active connections.
//!
//! Connections are held in an indexed arena; the slab key doubles as the
//! poll token, so readiness events map back to their connection in O(1).
//! Removing a failed entry never disturbs its neighbors.

use crate::engine::connection::Connection;
use slab::Slab;

pub(crate) struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a registry capped at `max_connections` entries.
    pub(crate) fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Whether the registry is at capacity.
    pub(crate) fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Insert a connection, returning its token.
    ///
    /// Returns `None` if the registry is at capacity.
    pub(crate) fn insert(&mut self, conn: Connection<S>) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub(crate) fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection, returning it for teardown.
    pub(crate) fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    pub(crate) fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }

    /// Tokens of all live connections. Collected up front so callers can
    /// mutate the registry while walking the set.
    pub(crate) fn ids(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }

    /// Remove every connection, yielding them for close-on-shutdown.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Connection<S>> + '_ {
        self.connections.drain()
    }
}
