//! The readiness loop.
//!
//! One thread per loop blocks on `mio::Poll` and performs every socket
//! operation and every connection-state mutation for the connections it
//! owns (single-writer discipline). The only cross-thread inputs are the
//! waker-backed inboxes on [`LoopHandle`]: streams handed off by the
//! acceptor, broadcast payloads, and the stop request.
//!
//! Readiness is edge-style, so the loop drives `try_read`/`try_write`
//! until they report blocked rather than trusting one step per event.
//! Write interest stays registered even while a queue is empty; the
//! spurious writable wakeups this causes are an accepted inefficiency.

use crate::config::EngineConfig;
use crate::engine::connection::{
    Connection, ConnectionHandle, Lifecycle, OutboundQueue, ReadStep, WriteStep,
};
use crate::engine::registry::ConnectionRegistry;
use crate::error::EngineError;
use crate::handler::EventHandler;
use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Token reserved for the loop's waker; slab keys start at 0 and never
/// reach it.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Cross-thread face of one event loop.
pub(crate) struct LoopHandle {
    waker: Arc<Waker>,
    /// Streams accepted elsewhere, awaiting registration on this loop.
    accept_inbox: Mutex<Vec<(TcpStream, SocketAddr)>>,
    /// Payloads to enqueue on every live connection of this loop.
    broadcast_inbox: Mutex<Vec<Bytes>>,
    stop: AtomicBool,
}

impl LoopHandle {
    fn new(waker: Arc<Waker>) -> Arc<Self> {
        Arc::new(Self {
            waker,
            accept_inbox: Mutex::new(Vec::new()),
            broadcast_inbox: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
        })
    }

    /// Hand an accepted stream to this loop and wake it.
    pub(crate) fn inject(&self, stream: TcpStream, peer: SocketAddr) {
        lock(&self.accept_inbox).push((stream, peer));
        self.wake();
    }

    /// Queue a payload for every connection this loop owns.
    pub(crate) fn broadcast(&self, payload: Bytes) {
        lock(&self.broadcast_inbox).push(payload);
        self.wake();
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake();
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            debug!(error = %e, "Loop wake failed");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A server-side readiness loop over a set of accepted connections.
///
/// Per-connection faults are isolated: the failed entry is surfaced to
/// the event sink, closed, and removed; the loop keeps serving the rest.
pub(crate) struct WorkerLoop {
    worker_id: usize,
    poll: Poll,
    events: Events,
    connections: ConnectionRegistry<TcpStream>,
    handle: Arc<LoopHandle>,
    handler: Arc<dyn EventHandler>,
    max_frame_len: usize,
}

impl WorkerLoop {
    pub(crate) fn new(
        worker_id: usize,
        handler: Arc<dyn EventHandler>,
        config: &EngineConfig,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            worker_id,
            poll,
            events: Events::with_capacity(config.events_capacity),
            connections: ConnectionRegistry::new(config.max_connections),
            handle: LoopHandle::new(waker),
            handler,
            max_frame_len: config.max_frame_len,
        })
    }

    pub(crate) fn handle(&self) -> Arc<LoopHandle> {
        Arc::clone(&self.handle)
    }

    pub(crate) fn run(mut self) -> Result<(), EngineError> {
        debug!(worker = self.worker_id, "Worker loop started");
        loop {
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.shutdown();
                    return Err(e.into());
                }
            }

            let mut woken = false;
            let mut ready: Vec<(usize, bool, bool)> = Vec::new();
            for event in self.events.iter() {
                match event.token() {
                    WAKER_TOKEN => woken = true,
                    Token(id) => ready.push((id, event.is_readable(), event.is_writable())),
                }
            }

            if self.handle.stop_requested() {
                self.shutdown();
                return Ok(());
            }

            if woken {
                self.register_injected();
                self.apply_broadcasts();
                self.flush_pending_output();
            }

            for (id, readable, writable) in ready {
                if let Err(e) = self.dispatch(id, readable, writable) {
                    self.fault(id, e);
                }
            }
        }
    }

    /// Register streams the acceptor handed off since the last wake.
    fn register_injected(&mut self) {
        let injected = std::mem::take(&mut *lock(&self.handle.accept_inbox));
        for (stream, peer) in injected {
            if self.connections.is_full() {
                warn!(worker = self.worker_id, %peer, "Connection limit reached, dropping");
                // Surfaced before the stream is dropped.
                self.handler.on_exception(&EngineError::AtCapacity);
                continue;
            }
            let queue = OutboundQueue::new();
            let conn = Connection::new(stream, Arc::clone(&queue), Lifecycle::Established);
            let id = match self.connections.insert(conn) {
                Some(id) => id,
                None => continue,
            };
            let conn = match self.connections.get_mut(id) {
                Some(conn) => conn,
                None => continue,
            };
            if let Err(e) = self.poll.registry().register(
                conn.stream_mut(),
                Token(id),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                warn!(worker = self.worker_id, %peer, "Register failed");
                self.fault(id, EngineError::Io(e));
                continue;
            }
            info!(
                worker = self.worker_id,
                conn_id = id,
                %peer,
                "Connection established"
            );
            self.handler
                .on_active(ConnectionHandle::new(queue, Arc::clone(&self.handle.waker)));
        }
    }

    /// Enqueue pending broadcast payloads on every live connection.
    fn apply_broadcasts(&mut self) {
        let payloads = std::mem::take(&mut *lock(&self.handle.broadcast_inbox));
        if payloads.is_empty() {
            return;
        }
        for id in self.connections.ids() {
            if let Some(conn) = self.connections.get_mut(id) {
                for payload in &payloads {
                    conn.enqueue(payload.clone());
                }
            }
        }
    }

    /// Attempt writes for every connection with queued output. Needed
    /// after producer enqueues: the writable edge may have passed while
    /// the queue was empty.
    fn flush_pending_output(&mut self) {
        for id in self.connections.ids() {
            let has_output = self
                .connections
                .get_mut(id)
                .map(|c| c.has_output())
                .unwrap_or(false);
            if !has_output {
                continue;
            }
            if let Err(e) = self.drive_writes(id) {
                self.fault(id, e);
            }
        }
    }

    fn dispatch(&mut self, id: usize, readable: bool, writable: bool) -> Result<(), EngineError> {
        if !self.connections.contains(id) {
            // Removed earlier in this batch
            return Ok(());
        }
        if readable {
            self.drive_reads(id)?;
        }
        if !self.connections.contains(id) {
            return Ok(());
        }
        if writable || readable {
            // A read may have enqueued a reply; flush regardless of the
            // writable bit.
            self.drive_writes(id)?;
        }
        Ok(())
    }

    /// Drive the read state machine until the socket blocks, handing
    /// completed frames to the event sink and queueing write-back
    /// replies.
    fn drive_reads(&mut self, id: usize) -> Result<(), EngineError> {
        loop {
            let conn = match self.connections.get_mut(id) {
                Some(conn) => conn,
                None => return Ok(()),
            };
            match conn.try_read(self.max_frame_len)? {
                ReadStep::Frame(payload) => {
                    let reply = self.handler.on_read(payload);
                    if reply.write_back {
                        if let Some(conn) = self.connections.get_mut(id) {
                            conn.enqueue(reply.bytes);
                        }
                    }
                }
                ReadStep::Continue => {}
                ReadStep::Blocked => return Ok(()),
                ReadStep::Eof => return Err(EngineError::ConnectionClosed),
            }
        }
    }

    /// Drive the write state machine until the socket blocks or the
    /// queue drains.
    fn drive_writes(&mut self, id: usize) -> Result<(), EngineError> {
        let conn = match self.connections.get_mut(id) {
            Some(conn) => conn,
            None => return Ok(()),
        };
        loop {
            match conn.try_write()? {
                WriteStep::Progress => {}
                WriteStep::Blocked | WriteStep::Idle => return Ok(()),
            }
        }
    }

    /// Surface a connection fault to the event sink, then close and
    /// remove just that entry.
    fn fault(&mut self, id: usize, error: EngineError) {
        if let Some(mut conn) = self.connections.remove(id) {
            conn.mark_closing();
            debug!(worker = self.worker_id, conn_id = id, error = %error, "Connection fault");
            // Surfaced before resources are released.
            self.handler.on_exception(&error);
            let _ = self.poll.registry().deregister(conn.stream_mut());
            conn.close();
        }
    }

    /// Close every tracked connection and release the poll. Best-effort;
    /// called on stop request or fatal poll error.
    fn shutdown(&mut self) {
        let remaining = self.connections.len();
        for mut conn in self.connections.drain() {
            let _ = self.poll.registry().deregister(conn.stream_mut());
            conn.close();
        }
        info!(
            worker = self.worker_id,
            closed = remaining,
            "Worker loop stopped"
        );
    }
}
