//! Per-connection read/write state machines.
//!
//! A [`Connection`] owns one socket's framing progress in both
//! directions. It is mutated only by the thread running its readiness
//! loop; the single exception is the [`OutboundQueue`], which producer
//! threads push onto through a [`ConnectionHandle`].
//!
//! The read side is an incremental decoder: a fixed 4-byte header buffer
//! fills first, then a body buffer sized exactly to the declared length.
//! Body bytes are never consumed before the header is fully parsed. The
//! write side drains one payload at a time, resuming from the
//! confirmed-sent offset after a partial write, so frames are never
//! interleaved on the wire.
//!
//! `Connection` is generic over the stream so the state machines can be
//! exercised against scripted streams in tests; the loops instantiate it
//! with `mio::net::TcpStream`.

use crate::codec::{self, HEADER_LEN};
use crate::error::EngineError;
use bytes::Bytes;
use mio::Waker;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Coarse connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Non-blocking connect initiated, handshake not finished.
    Connecting,
    /// Usable for reads and writes.
    Established,
    /// Fault observed, teardown in progress.
    Closing,
    /// Resources released. Entered at most once.
    Closed,
}

/// Incremental frame-decoding state.
///
/// Exactly one of the two buffers has remaining capacity at any time.
enum ReadPhase {
    /// Accumulating the 4-byte length prefix.
    Header { buf: [u8; HEADER_LEN], filled: usize },
    /// Accumulating a body of known length; `buf.len()` is the declared
    /// length, allocated lazily once the header completed.
    Body { buf: Vec<u8>, filled: usize },
}

impl ReadPhase {
    fn header() -> Self {
        ReadPhase::Header {
            buf: [0u8; HEADER_LEN],
            filled: 0,
        }
    }
}

/// Outcome of one [`Connection::try_read`] step.
///
/// Each step performs at most one read syscall; the loop keeps stepping
/// until `Blocked` or `Eof`.
pub(crate) enum ReadStep {
    /// A full frame was assembled.
    Frame(Bytes),
    /// Bytes were consumed but no frame completed yet; step again.
    Continue,
    /// The socket has no more data for now.
    Blocked,
    /// Peer closed the read side.
    Eof,
}

/// Outcome of one [`Connection::try_write`] step.
pub(crate) enum WriteStep {
    /// Bytes were accepted by the socket; step again.
    Progress,
    /// The socket cannot accept more bytes for now.
    Blocked,
    /// Nothing pending and the queue is empty.
    Idle,
}

/// The in-flight outbound payload: header plus body, with the number of
/// bytes the kernel has confirmed so far. Owned per connection so a
/// partial write resumes exactly where it stopped.
struct PendingWrite {
    header: [u8; HEADER_LEN],
    payload: Bytes,
    sent: usize,
}

impl PendingWrite {
    fn total(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Unbounded FIFO of payloads awaiting transmission.
///
/// The only per-connection structure touched by non-loop threads. No
/// backpressure: `push` never blocks and never rejects while the
/// connection is open. After close, pushes are dropped.
pub(crate) struct OutboundQueue {
    inner: Mutex<VecDeque<Bytes>>,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Append a payload. Returns `false` (payload dropped) if the
    /// connection already closed.
    pub(crate) fn push(&self, payload: Bytes) -> bool {
        let mut inner = self.lock();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        inner.push_back(payload);
        true
    }

    fn pop(&self) -> Option<Bytes> {
        self.lock().pop_front()
    }

    fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.lock().clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Bytes>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer-side handle to one connection.
///
/// Cloneable and thread-safe; the only operations are enqueueing
/// outbound payloads and observing whether the connection closed.
#[derive(Clone)]
pub struct ConnectionHandle {
    queue: Arc<OutboundQueue>,
    waker: Arc<Waker>,
}

impl ConnectionHandle {
    pub(crate) fn new(queue: Arc<OutboundQueue>, waker: Arc<Waker>) -> Self {
        Self { queue, waker }
    }

    /// Enqueue a payload for transmission, in FIFO order with respect to
    /// other `enqueue` calls on this handle's connection.
    ///
    /// Non-blocking. May be called before the connection is established;
    /// frames flush once the socket becomes write-ready. Returns `false`
    /// if the connection already closed, in which case the payload is
    /// dropped.
    pub fn enqueue(&self, payload: impl Into<Bytes>) -> bool {
        let queued = self.queue.push(payload.into());
        if queued {
            if let Err(e) = self.waker.wake() {
                debug!(error = %e, "Loop wake failed");
            }
        }
        queued
    }

    /// Whether the underlying connection has closed.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

/// One socket's read state, write cursor, and outbound queue.
pub(crate) struct Connection<S> {
    stream: S,
    read: ReadPhase,
    pending: Option<PendingWrite>,
    queue: Arc<OutboundQueue>,
    lifecycle: Lifecycle,
}

impl<S: Read + Write> Connection<S> {
    pub(crate) fn new(stream: S, queue: Arc<OutboundQueue>, lifecycle: Lifecycle) -> Self {
        Self {
            stream,
            read: ReadPhase::header(),
            pending: None,
            queue,
            lifecycle,
        }
    }

    pub(crate) fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub(crate) fn mark_established(&mut self) {
        if self.lifecycle == Lifecycle::Connecting {
            self.lifecycle = Lifecycle::Established;
        }
    }

    pub(crate) fn mark_closing(&mut self) {
        if self.lifecycle != Lifecycle::Closed {
            self.lifecycle = Lifecycle::Closing;
        }
    }

    /// Enqueue from the loop thread itself (handler replies).
    pub(crate) fn enqueue(&self, payload: Bytes) {
        self.queue.push(payload);
    }

    /// Whether `try_write` has anything left to do.
    pub(crate) fn has_output(&self) -> bool {
        self.pending.is_some() || !self.queue.is_empty()
    }

    /// Advance the read state machine by at most one read syscall.
    ///
    /// Body bytes are never read before the header is complete. A header
    /// declaring more than `max_frame_len` is a protocol error. A
    /// zero-length body completes immediately, without waiting for
    /// another readiness notification.
    pub(crate) fn try_read(&mut self, max_frame_len: usize) -> Result<ReadStep, EngineError> {
        match &mut self.read {
            ReadPhase::Header { buf, filled } => {
                match self.stream.read(&mut buf[*filled..]) {
                    Ok(0) => Ok(ReadStep::Eof),
                    Ok(n) => {
                        *filled += n;
                        if *filled < HEADER_LEN {
                            return Ok(ReadStep::Continue);
                        }
                        let declared = codec::parse_header(*buf) as usize;
                        if declared > max_frame_len {
                            return Err(EngineError::FrameTooLarge {
                                declared: declared as u64,
                                max: max_frame_len,
                            });
                        }
                        if declared == 0 {
                            self.read = ReadPhase::header();
                            return Ok(ReadStep::Frame(Bytes::new()));
                        }
                        self.read = ReadPhase::Body {
                            buf: vec![0u8; declared],
                            filled: 0,
                        };
                        Ok(ReadStep::Continue)
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadStep::Blocked),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadStep::Continue),
                    Err(e) => Err(e.into()),
                }
            }
            ReadPhase::Body { buf, filled } => {
                match self.stream.read(&mut buf[*filled..]) {
                    Ok(0) => Ok(ReadStep::Eof),
                    Ok(n) => {
                        *filled += n;
                        if *filled < buf.len() {
                            return Ok(ReadStep::Continue);
                        }
                        let payload = Bytes::from(std::mem::take(buf));
                        self.read = ReadPhase::header();
                        Ok(ReadStep::Frame(payload))
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadStep::Blocked),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadStep::Continue),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Advance the write state machine by at most one write syscall.
    ///
    /// One payload drains to completion before the next is dequeued, so
    /// frames never interleave. A partial write leaves the cursor at the
    /// confirmed-sent offset and resumes there on the next call.
    pub(crate) fn try_write(&mut self) -> io::Result<WriteStep> {
        if self.pending.is_none() {
            match self.queue.pop() {
                Some(payload) => {
                    let len = u32::try_from(payload.len()).map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidInput, "payload exceeds u32 range")
                    })?;
                    self.pending = Some(PendingWrite {
                        header: codec::encode_header(len),
                        payload,
                        sent: 0,
                    });
                }
                None => return Ok(WriteStep::Idle),
            }
        }
        let pending = match self.pending.as_mut() {
            Some(pending) => pending,
            None => return Ok(WriteStep::Idle),
        };

        let segment: &[u8] = if pending.sent < HEADER_LEN {
            &pending.header[pending.sent..]
        } else {
            &pending.payload[pending.sent - HEADER_LEN..]
        };

        match self.stream.write(segment) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write returned 0",
            )),
            Ok(n) => {
                pending.sent += n;
                if pending.sent == pending.total() {
                    self.pending = None;
                }
                Ok(WriteStep::Progress)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(WriteStep::Blocked),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(WriteStep::Progress),
            Err(e) => Err(e),
        }
    }

    /// Release queued buffers and mark the connection `Closed`.
    ///
    /// Idempotent: returns `true` only on the transition, `false` when
    /// already closed.
    pub(crate) fn close(&mut self) -> bool {
        if self.lifecycle == Lifecycle::Closed {
            return false;
        }
        self.lifecycle = Lifecycle::Closed;
        self.queue.close();
        self.pending = None;
        self.read = ReadPhase::header();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    /// Read side yields scripted chunks, one per syscall, then
    /// `WouldBlock` (or EOF). Write side accepts at most `write_limit`
    /// bytes per syscall and records everything accepted.
    struct ScriptedStream {
        chunks: VecDeque<Vec<u8>>,
        eof_after_chunks: bool,
        written: Vec<u8>,
        write_limit: usize,
    }

    impl ScriptedStream {
        fn with_chunks(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks: chunks.into(),
                eof_after_chunks: false,
                written: Vec::new(),
                write_limit: usize::MAX,
            }
        }

        fn writer(write_limit: usize) -> Self {
            Self {
                chunks: VecDeque::new(),
                eof_after_chunks: false,
                written: Vec::new(),
                write_limit,
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut chunk = match self.chunks.pop_front() {
                Some(c) => c,
                None if self.eof_after_chunks => return Ok(0),
                None => return Err(io::ErrorKind::WouldBlock.into()),
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.chunks.push_front(chunk.split_off(n));
            }
            Ok(n)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.write_limit);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    const MAX_FRAME: usize = 16 * 1024 * 1024;

    fn conn(stream: ScriptedStream) -> Connection<ScriptedStream> {
        Connection::new(stream, OutboundQueue::new(), Lifecycle::Established)
    }

    /// Drive try_read until blocked/EOF, collecting completed frames.
    fn drain_read(c: &mut Connection<ScriptedStream>) -> Vec<Bytes> {
        let mut frames = Vec::new();
        loop {
            match c.try_read(MAX_FRAME).unwrap() {
                ReadStep::Frame(p) => frames.push(p),
                ReadStep::Continue => {}
                ReadStep::Blocked | ReadStep::Eof => return frames,
            }
        }
    }

    /// Drive try_write until blocked or idle.
    fn drain_write(c: &mut Connection<ScriptedStream>) {
        loop {
            match c.try_write().unwrap() {
                WriteStep::Progress => {}
                WriteStep::Blocked | WriteStep::Idle => return,
            }
        }
    }

    #[test]
    fn test_roundtrip_single_chunk() {
        let wire = codec::encode(b"hello").to_vec();
        let mut c = conn(ScriptedStream::with_chunks(vec![wire]));
        let frames = drain_read(&mut c);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"hello");
    }

    #[test]
    fn test_partial_delivery_invariance() {
        // The same frame split into 1-byte chunks decodes identically.
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let wire = codec::encode(&payload).to_vec();
        let chunks: Vec<Vec<u8>> = wire.iter().map(|b| vec![*b]).collect();

        let mut c = conn(ScriptedStream::with_chunks(chunks));
        let frames = drain_read(&mut c);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &payload[..]);
    }

    #[test]
    fn test_header_split_across_reads() {
        let wire = codec::encode(b"ab").to_vec();
        // Split inside the header: 2 bytes, then the rest.
        let chunks = vec![wire[..2].to_vec(), wire[2..].to_vec()];
        let mut c = conn(ScriptedStream::with_chunks(chunks));
        let frames = drain_read(&mut c);
        assert_eq!(&frames[0][..], b"ab");
    }

    #[test]
    fn test_multiple_frames_in_wire_order() {
        let mut wire = codec::encode(b"one").to_vec();
        wire.extend_from_slice(&codec::encode(b"two"));
        wire.extend_from_slice(&codec::encode(b""));
        let mut c = conn(ScriptedStream::with_chunks(vec![wire]));
        let frames = drain_read(&mut c);
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], b"one");
        assert_eq!(&frames[1][..], b"two");
        assert!(frames[2].is_empty());
    }

    #[test]
    fn test_zero_length_frame_completes_without_body_read() {
        // Only the 4 zero header bytes are ever delivered.
        let mut c = conn(ScriptedStream::with_chunks(vec![vec![0, 0, 0, 0]]));
        let frames = drain_read(&mut c);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_empty());
    }

    #[test]
    fn test_oversized_declared_length_is_protocol_error() {
        let mut c = conn(ScriptedStream::with_chunks(vec![vec![0xFF, 0xFF, 0xFF, 0xFF]]));
        let err = loop {
            match c.try_read(1024) {
                Ok(ReadStep::Continue) => {}
                Ok(_) => panic!("expected protocol error"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, EngineError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_eof_mid_frame_is_reported() {
        let wire = codec::encode(b"truncated").to_vec();
        let mut stream = ScriptedStream::with_chunks(vec![wire[..6].to_vec()]);
        stream.eof_after_chunks = true;
        let mut c = conn(stream);
        loop {
            match c.try_read(MAX_FRAME).unwrap() {
                ReadStep::Continue => {}
                ReadStep::Eof => break,
                _ => panic!("expected EOF"),
            }
        }
    }

    #[test]
    fn test_fifo_preserved_across_partial_writes() {
        // 3 bytes per syscall forces every frame through several
        // partial writes; wire order must match enqueue order.
        let mut c = conn(ScriptedStream::writer(3));
        c.enqueue(Bytes::from_static(b"first"));
        c.enqueue(Bytes::from_static(b"second"));
        c.enqueue(Bytes::from_static(b"third"));
        drain_write(&mut c);

        let mut expected = codec::encode(b"first").to_vec();
        expected.extend_from_slice(&codec::encode(b"second"));
        expected.extend_from_slice(&codec::encode(b"third"));
        assert_eq!(c.stream_mut().written, expected);
        assert!(!c.has_output());
    }

    #[test]
    fn test_write_idle_on_empty_queue() {
        let mut c = conn(ScriptedStream::writer(usize::MAX));
        assert!(matches!(c.try_write().unwrap(), WriteStep::Idle));
    }

    #[test]
    fn test_zero_length_payload_writes_header_only() {
        let mut c = conn(ScriptedStream::writer(usize::MAX));
        c.enqueue(Bytes::new());
        drain_write(&mut c);
        assert_eq!(c.stream_mut().written, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut c = conn(ScriptedStream::writer(usize::MAX));
        c.enqueue(Bytes::from_static(b"pending"));
        assert!(c.close());
        assert_eq!(c.lifecycle(), Lifecycle::Closed);
        assert!(!c.close());
        assert!(!c.has_output());
    }

    #[test]
    fn test_enqueue_after_close_is_dropped() {
        let queue = OutboundQueue::new();
        let mut c = Connection::new(
            ScriptedStream::writer(usize::MAX),
            Arc::clone(&queue),
            Lifecycle::Established,
        );
        c.close();
        assert!(!queue.push(Bytes::from_static(b"late")));
        assert!(!c.has_output());
    }

    #[test]
    fn test_lifecycle_established_only_from_connecting() {
        let mut c = Connection::new(
            ScriptedStream::writer(usize::MAX),
            OutboundQueue::new(),
            Lifecycle::Connecting,
        );
        assert_eq!(c.lifecycle(), Lifecycle::Connecting);
        c.mark_established();
        assert_eq!(c.lifecycle(), Lifecycle::Established);
        c.close();
        c.mark_established();
        assert_eq!(c.lifecycle(), Lifecycle::Closed);
    }
}
