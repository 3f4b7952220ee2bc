use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::buffer::ByteStreamBuffer;
use crate::error::{FrameError, Result};
use crate::json::JsonObjectDecoder;
use crate::line::LineDecoder;

/// One complete message pulled off the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A balanced JSON value and the number of bytes it occupied.
    Object { value: Value, consumed: usize },
    /// A terminator-delimited line with the terminator stripped.
    Line(String),
    /// A complete object the JSON parser rejected. The bytes are gone from
    /// the buffer; the owner decides how to report it.
    Malformed { message: String, consumed: usize },
}

/// Framing mode for one connection.
#[derive(Debug)]
pub enum FrameDecoder {
    Json(JsonObjectDecoder),
    Line(LineDecoder),
}

impl FrameDecoder {
    pub fn json() -> Self {
        Self::Json(JsonObjectDecoder::new())
    }

    pub fn line(terminator: impl Into<Vec<u8>>) -> Self {
        Self::Line(LineDecoder::new(terminator))
    }

    pub fn decode(&mut self, buf: &mut ByteStreamBuffer) -> Result<Option<Frame>> {
        match self {
            Self::Json(decoder) => decoder.decode(buf),
            Self::Line(decoder) => decoder.decode(buf),
        }
    }

    /// Forget any scan state tied to bytes that were dropped externally.
    pub fn reset(&mut self) {
        if let Self::Line(decoder) = self {
            decoder.reset();
        }
    }
}

/// Tokio codec adapter around [`FrameDecoder`].
///
/// Decoding borrows the `FramedRead` buffer as a [`ByteStreamBuffer`] for
/// the duration of one call. Encoding is a passthrough: payloads are already
/// complete wire messages (a serialized object or a terminated line).
#[derive(Debug)]
pub struct FrameCodec {
    decoder: FrameDecoder,
}

impl FrameCodec {
    pub fn new(decoder: FrameDecoder) -> Self {
        Self { decoder }
    }

    pub fn json() -> Self {
        Self::new(FrameDecoder::json())
    }

    pub fn line(terminator: impl Into<Vec<u8>>) -> Self {
        Self::new(FrameDecoder::line(terminator))
    }

    pub fn reset(&mut self) {
        self.decoder.reset();
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let mut buf = ByteStreamBuffer::from(std::mem::take(src));
        let result = self.decoder.decode(&mut buf);
        *src = buf.into_inner();
        result
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            debug!(bytes = src.len(), "dropping partial frame at end of stream");
            src.clear();
            self.decoder.reset();
        }
        Ok(None)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
