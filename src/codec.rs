//! Frame codec: the on-wire representation of a message.
//!
//! Every frame is a 4-byte big-endian length prefix followed by exactly
//! that many raw payload bytes:
//!
//! ```text
//! ┌──────────┬─────────────────┐
//! │ Length   │ Payload         │
//! │ 4 bytes  │ `length` bytes  │
//! │ uint32 BE│ opaque          │
//! └──────────┴─────────────────┘
//! ```
//!
//! No checksum, no version byte. The codec enforces no maximum length;
//! the connection read path applies the configured `max_frame_len`.
//!
//! Encoding is a pure function here. Decoding is incremental and lives in
//! the connection state machine, because a frame may arrive split across
//! arbitrarily many readiness notifications.

use bytes::{BufMut, BytesMut};

/// Length-prefix size in bytes (fixed, exactly 4).
pub const HEADER_LEN: usize = 4;

/// Encode the length prefix for a payload of `len` bytes.
#[inline]
pub fn encode_header(len: u32) -> [u8; HEADER_LEN] {
    len.to_be_bytes()
}

/// Parse a complete length prefix (unsigned big-endian interpretation).
#[inline]
pub fn parse_header(buf: [u8; HEADER_LEN]) -> u32 {
    u32::from_be_bytes(buf)
}

/// Encode a full frame: header followed by the payload.
///
/// Intended for tests and one-shot callers; the write path streams the
/// header and payload separately to avoid copying the payload.
pub fn encode(payload: &[u8]) -> BytesMut {
    debug_assert!(payload.len() <= u32::MAX as usize, "payload exceeds u32 range");
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&encode_header(payload.len() as u32));
    buf.put_slice(payload);
    buf
}
