//! Server role: bind, accept, and dispatch connections to event loops.
//!
//! One acceptor thread blocks on a dedicated poll over the listener; each
//! accepted stream is switched to non-blocking by the OS accept path and
//! handed to one of `event_loops` worker loops chosen round-robin. Pool
//! size 1 degenerates to the single-loop strategy. Workers isolate
//! per-connection faults; only the failed entry leaves the registry.

use crate::config::EngineConfig;
use crate::engine::event_loop::{LoopHandle, WorkerLoop, WAKER_TOKEN};
use crate::error::EngineError;
use crate::handler::EventHandler;
use bytes::Bytes;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);

/// Cross-thread face of the acceptor loop.
struct AcceptorHandle {
    waker: Waker,
    stop: AtomicBool,
}

/// A running server engine.
///
/// Dropping the server (or calling [`Server::shutdown`]) stops the
/// acceptor and every worker loop and closes all sockets. There is no
/// automatic restart.
pub struct Server {
    local_addr: SocketAddr,
    acceptor: Option<JoinHandle<()>>,
    acceptor_handle: Arc<AcceptorHandle>,
    loops: Vec<Arc<LoopHandle>>,
    workers: Vec<JoinHandle<()>>,
}

impl Server {
    /// Bind `addr` and start accepting connections.
    ///
    /// `handler` is shared across all accepted connections and invoked
    /// from the worker loop threads.
    pub fn startup(
        addr: SocketAddr,
        handler: Arc<dyn EventHandler>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let listener = bind_listener(addr)?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr()?;

        let pool_len = config.event_loops.max(1);
        let mut loops = Vec::with_capacity(pool_len);
        let mut workers = Vec::with_capacity(pool_len);
        for worker_id in 0..pool_len {
            let worker = WorkerLoop::new(worker_id, Arc::clone(&handler), &config)?;
            loops.push(worker.handle());
            let handle = thread::Builder::new()
                .name(format!("netframe-loop-{worker_id}"))
                .spawn(move || {
                    if let Err(e) = worker.run() {
                        error!(worker = worker_id, error = %e, "Worker loop failed");
                    }
                })
                .map_err(EngineError::Io)?;
            workers.push(handle);
        }

        let accept_poll = Poll::new()?;
        accept_poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let acceptor_handle = Arc::new(AcceptorHandle {
            waker: Waker::new(accept_poll.registry(), WAKER_TOKEN)?,
            stop: AtomicBool::new(false),
        });

        info!(addr = %local_addr, loops = pool_len, "Server started");

        let acceptor = {
            let handle = Arc::clone(&acceptor_handle);
            let pool = loops.clone();
            thread::Builder::new()
                .name("netframe-acceptor".to_string())
                .spawn(move || {
                    if let Err(e) = accept_loop(accept_poll, listener, handle, pool) {
                        error!(error = %e, "Acceptor failed");
                    }
                })
                .map_err(EngineError::Io)?
        };

        Ok(Self {
            local_addr,
            acceptor: Some(acceptor),
            acceptor_handle,
            loops,
            workers,
        })
    }

    /// The address the listener is bound to. Useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Enqueue `payload` on every currently live connection.
    ///
    /// Per-connection FIFO order is preserved; no ordering is guaranteed
    /// across different connections.
    pub fn write_to_all(&self, payload: impl Into<Bytes>) {
        let payload = payload.into();
        for handle in &self.loops {
            handle.broadcast(payload.clone());
        }
    }

    /// Stop the acceptor and all loops, close every socket, and join the
    /// threads. Idempotent.
    pub fn shutdown(&mut self) {
        self.acceptor_handle.stop.store(true, Ordering::Release);
        if let Err(e) = self.acceptor_handle.waker.wake() {
            debug!(error = %e, "Acceptor wake failed");
        }
        for handle in &self.loops {
            handle.request_stop();
        }
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        info!(addr = %self.local_addr, "Server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    mut poll: Poll,
    listener: TcpListener,
    handle: Arc<AcceptorHandle>,
    pool: Vec<Arc<LoopHandle>>,
) -> io::Result<()> {
    let mut events = Events::with_capacity(64);
    let mut next_loop = 0usize;

    loop {
        match poll.poll(&mut events, None) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }

        if handle.stop.load(Ordering::Acquire) {
            debug!("Acceptor stopping");
            return Ok(());
        }

        // Accept until the listener would block.
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let idx = next_loop % pool.len();
                    next_loop = next_loop.wrapping_add(1);
                    debug!(%peer, loop_idx = idx, "Accepted connection");
                    pool[idx].inject(stream, peer);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }
}

/// Build the non-blocking listener socket.
fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
