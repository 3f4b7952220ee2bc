use std::borrow::Cow;

use bytes::{Bytes, BytesMut};

use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Accumulates raw transport bytes until a decoder can frame them.
///
/// Backed by [`BytesMut`], so appends grow amortized and consuming from the
/// front does not shift the remaining bytes.
#[derive(Debug, Default)]
pub struct ByteStreamBuffer {
    buf: BytesMut,
}

impl ByteStreamBuffer {
    /// Create an empty buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_BUFFER_CAPACITY)
    }

    /// Create an empty buffer with explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Append received bytes to the tail.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Remove and return the first `n` bytes.
    pub fn consume(&mut self, n: usize) -> Result<Bytes> {
        if n > self.buf.len() {
            return Err(FrameError::BufferUnderrun {
                requested: n,
                available: self.buf.len(),
            });
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Decode the buffered bytes as UTF-8 text.
    ///
    /// Returns `None` when the buffer ends in the middle of a code point; the
    /// rest of it has simply not arrived yet. Invalid sequences are replaced
    /// rather than reported.
    pub fn peek_as_text(&self) -> Option<Cow<'_, str>> {
        match std::str::from_utf8(&self.buf) {
            Ok(text) => Some(Cow::Borrowed(text)),
            Err(err) if err.error_len().is_none() => None,
            Err(_) => Some(String::from_utf8_lossy(&self.buf)),
        }
    }

    /// Position of the first occurrence of `needle` at or after `from`.
    pub fn find(&self, needle: &[u8], from: usize) -> Option<usize> {
        if needle.is_empty() || from >= self.buf.len() {
            return None;
        }
        self.buf[from..]
            .windows(needle.len())
            .position(|window| window == needle)
            .map(|pos| pos + from)
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Borrow the buffered bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Return the backing storage.
    pub fn into_inner(self) -> BytesMut {
        self.buf
    }
}

impl From<BytesMut> for ByteStreamBuffer {
    fn from(buf: BytesMut) -> Self {
        Self { buf }
    }
}
