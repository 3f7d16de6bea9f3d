//! Client role: one connection, one readiness loop.
//!
//! `startup` initiates a non-blocking connect and spawns the loop
//! thread; the connect completes on the first writable readiness. The
//! single connection's fate and the loop's fate are deliberately tied:
//! any fault exits the loop, surfaces through `on_exception`, and flips
//! the connect gate to `Failed` if the connect never completed.
//!
//! Callers wait on the gate through [`Client::await_connected`] instead
//! of spinning on a status flag; [`Client::status`] remains for
//! non-blocking polls.

use crate::config::EngineConfig;
use crate::engine::connection::{Connection, ConnectionHandle, OutboundQueue, ReadStep, WriteStep};
use crate::engine::event_loop::WAKER_TOKEN;
use crate::engine::Lifecycle;
use crate::error::EngineError;
use crate::handler::EventHandler;
use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

const CONN_TOKEN: Token = Token(0);

/// Observable phase of the non-blocking connect.
///
/// Transitions are monotonic: `Pending → Available` or
/// `Pending → Failed` only. `Failed` is permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// Connect initiated, handshake not finished.
    Pending,
    /// Connection established and usable for writes.
    Available,
    /// Connect failed or the loop exited before establishing.
    Failed,
}

/// One-shot connect notification: a condition the caller can block on
/// without spinning.
pub(crate) struct ConnectGate {
    state: Mutex<ConnectStatus>,
    cond: Condvar,
}

impl ConnectGate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConnectStatus::Pending),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn set_available(&self) {
        let mut state = self.lock();
        if *state == ConnectStatus::Pending {
            *state = ConnectStatus::Available;
            self.cond.notify_all();
        }
    }

    pub(crate) fn fail(&self) {
        let mut state = self.lock();
        if *state == ConnectStatus::Pending {
            *state = ConnectStatus::Failed;
            self.cond.notify_all();
        }
    }

    pub(crate) fn status(&self) -> ConnectStatus {
        *self.lock()
    }

    /// Block until the gate leaves `Pending`.
    pub(crate) fn await_connected(&self) -> Result<(), EngineError> {
        let mut state = self.lock();
        while *state == ConnectStatus::Pending {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match *state {
            ConnectStatus::Available => Ok(()),
            _ => Err(EngineError::ConnectFailed(
                "connection never became available".to_string(),
            )),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectStatus> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A running client engine for one connection.
pub struct Client {
    handle: ConnectionHandle,
    gate: Arc<ConnectGate>,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

impl Client {
    /// Initiate a non-blocking connect to `addr` and start the loop.
    ///
    /// Returns as soon as the connect is in flight; use
    /// [`Client::await_connected`] to wait for the outcome.
    pub fn startup(
        addr: SocketAddr,
        handler: Arc<dyn EventHandler>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let stream = TcpStream::connect(addr)?;
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let queue = OutboundQueue::new();
        let mut conn = Connection::new(stream, Arc::clone(&queue), Lifecycle::Connecting);
        poll.registry().register(
            conn.stream_mut(),
            CONN_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let gate = ConnectGate::new();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = ConnectionHandle::new(queue, Arc::clone(&waker));

        let thread = {
            let gate = Arc::clone(&gate);
            let stop = Arc::clone(&stop);
            let handle = handle.clone();
            let events_capacity = config.events_capacity;
            let max_frame_len = config.max_frame_len;
            thread::Builder::new()
                .name("netframe-client".to_string())
                .spawn(move || {
                    let events = Events::with_capacity(events_capacity);
                    let result = client_loop(
                        poll,
                        events,
                        &mut conn,
                        handler.as_ref(),
                        &gate,
                        &stop,
                        handle,
                        max_frame_len,
                    );
                    if let Err(e) = result {
                        error!(error = %e, "Client loop failed");
                        // Surfaced before the socket is released.
                        handler.on_exception(&e);
                    }
                    conn.close();
                    // Permanent: a caller polling after failure must
                    // never observe Pending again.
                    gate.fail();
                })
                .map_err(EngineError::Io)?
        };

        Ok(Self {
            handle,
            gate,
            stop,
            waker,
            thread: Some(thread),
        })
    }

    /// Block until the connect completes or fails.
    pub fn await_connected(&self) -> Result<(), EngineError> {
        self.gate.await_connected()
    }

    /// Non-blocking connect status poll.
    pub fn status(&self) -> ConnectStatus {
        self.gate.status()
    }

    /// Enqueue a payload for the server, in FIFO order.
    ///
    /// Non-blocking; may be called before the connection is established,
    /// in which case frames flush once the connect completes. Returns
    /// `false` if the connection already closed (payload dropped).
    pub fn write_to_server(&self, payload: impl Into<Bytes>) -> bool {
        self.handle.enqueue(payload)
    }

    /// A cloneable producer handle for this connection.
    pub fn connection(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Stop the loop, close the socket, and join the thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            debug!(error = %e, "Client wake failed");
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(clippy::too_many_arguments)]
fn client_loop(
    mut poll: Poll,
    mut events: Events,
    conn: &mut Connection<TcpStream>,
    handler: &dyn EventHandler,
    gate: &ConnectGate,
    stop: &AtomicBool,
    handle: ConnectionHandle,
    max_frame_len: usize,
) -> Result<(), EngineError> {
    loop {
        match poll.poll(&mut events, None) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }

        let mut readable = false;
        let mut writable = false;
        for event in events.iter() {
            match event.token() {
                CONN_TOKEN => {
                    readable |= event.is_readable();
                    writable |= event.is_writable();
                }
                _ => {} // waker
            }
        }

        if stop.load(Ordering::Acquire) {
            let _ = poll.registry().deregister(conn.stream_mut());
            info!("Client loop stopped");
            return Ok(());
        }

        if conn.lifecycle() == Lifecycle::Connecting && writable {
            finish_connect(conn)?;
            if conn.lifecycle() == Lifecycle::Established {
                gate.set_available();
                handler.on_active(handle.clone());
            }
        }

        if conn.lifecycle() != Lifecycle::Established {
            continue;
        }

        if readable {
            drive_reads(conn, handler, max_frame_len)?;
        }
        // Flush unconditionally: a waker wake means a producer enqueued,
        // and a read may have queued a reply.
        drive_writes(conn)?;
    }
}

/// Complete the non-blocking connect handshake once the socket reports
/// writable.
fn finish_connect(conn: &mut Connection<TcpStream>) -> Result<(), EngineError> {
    if let Some(e) = conn.stream_mut().take_error()? {
        return Err(EngineError::ConnectFailed(e.to_string()));
    }
    match conn.stream_mut().peer_addr() {
        Ok(peer) => {
            conn.mark_established();
            info!(%peer, "Connected to server");
            Ok(())
        }
        // Writable fired but the handshake is still in flight.
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        Err(e) => Err(EngineError::ConnectFailed(e.to_string())),
    }
}

fn drive_reads(
    conn: &mut Connection<TcpStream>,
    handler: &dyn EventHandler,
    max_frame_len: usize,
) -> Result<(), EngineError> {
    loop {
        match conn.try_read(max_frame_len)? {
            ReadStep::Frame(payload) => {
                let reply = handler.on_read(payload);
                if reply.write_back {
                    conn.enqueue(reply.bytes);
                }
            }
            ReadStep::Continue => {}
            ReadStep::Blocked => return Ok(()),
            ReadStep::Eof => return Err(EngineError::ConnectionClosed),
        }
    }
}

fn drive_writes(conn: &mut Connection<TcpStream>) -> Result<(), EngineError> {
    loop {
        match conn.try_write()? {
            WriteStep::Progress => {}
            WriteStep::Blocked | WriteStep::Idle => return Ok(()),
        }
    }
}
