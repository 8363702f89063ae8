//! Frame encoding and splitting.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - N bytes: UTF-8 JSON header
//! - 1 byte: line feed delimiter (only when a body follows)
//! - M bytes: opaque binary body
//!
//! The first line feed is the separator; any later line feeds belong to
//! the body. A frame without a line feed is a bare header with an empty
//! body. The total frame size is capped at [`MAX_MESSAGE_SIZE`] bytes and
//! the receiving side enforces the cap as a read limit.

use std::io::{self, Write};

/// Maximum size of one frame on the wire, in bytes.
///
/// This is 64,000 decimal, not 64 KiB. The value is part of the wire
/// contract; peers size their stdin chunks against it.
pub const MAX_MESSAGE_SIZE: usize = 64_000;

/// Byte separating the header from the body.
pub const DELIMITER: u8 = b'\n';

/// Splits a frame into its header and body components.
///
/// All frames have a header. When no delimiter is present the whole
/// payload is the header and the body is empty.
pub fn split_message(payload: &[u8]) -> (&[u8], &[u8]) {
    match payload.iter().position(|&b| b == DELIMITER) {
        Some(ix) => (&payload[..ix], &payload[ix + 1..]),
        None => (payload, &[]),
    }
}

/// Encodes a header and body into a single frame.
pub fn encode_message(header: &[u8], body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(header.len() + 1 + body.len());
    frame.extend_from_slice(header);
    frame.push(DELIMITER);
    frame.extend_from_slice(body);
    frame
}

/// Largest body that fits in one frame alongside the given header.
pub fn max_body_len(header: &[u8]) -> usize {
    MAX_MESSAGE_SIZE.saturating_sub(header.len() + 1)
}

/// Writer adapter that prefixes every write with `header` and the
/// delimiter, emitting one full frame per call.
///
/// Reports the number of payload bytes written, not the total put on the
/// wire, so it composes with `io::copy`.
pub struct HeaderWriter<W> {
    inner: W,
    header: Vec<u8>,
}

impl<W: Write> HeaderWriter<W> {
    /// Wraps `inner` so every write carries `header`.
    pub fn new(inner: W, header: Vec<u8>) -> Self {
        Self { inner, header }
    }

    /// Consumes the adapter, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for HeaderWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write_all(&encode_message(&self.header, buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
