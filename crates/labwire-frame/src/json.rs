use serde_json::Value;
use tracing::{debug, warn};

use crate::buffer::ByteStreamBuffer;
use crate::codec::Frame;
use crate::error::Result;

/// Every JSON-RPC message is an object, so this is the only valid start byte.
const OBJECT_START: u8 = b'{';

/// Frames balanced JSON objects out of a byte stream.
///
/// The buffer is parsed from its start as one JSON value; the parser reports
/// how many bytes the value occupied. Leading bytes that cannot begin an
/// object are discarded up to the next `{`, so a peer that sends garbage
/// cannot wedge the stream. If no `{` has arrived yet, everything is kept.
#[derive(Debug, Default)]
pub struct JsonObjectDecoder {
    discarded: u64,
}

impl JsonObjectDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total non-whitespace bytes dropped by resynchronization so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Try to extract one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A complete but malformed
    /// object is consumed and reported as [`Frame::Malformed`].
    pub fn decode(&mut self, buf: &mut ByteStreamBuffer) -> Result<Option<Frame>> {
        let Some(start) = buf.as_bytes().iter().position(|&b| b == OBJECT_START) else {
            return Ok(None);
        };

        if start > 0 {
            let skipped = buf.consume(start)?;
            if skipped.iter().any(|b| !b.is_ascii_whitespace()) {
                self.discarded += start as u64;
                warn!(bytes = start, "discarding bytes before next JSON object");
            }
        }

        let parsed = {
            let mut stream = serde_json::Deserializer::from_slice(buf.as_bytes()).into_iter::<Value>();
            match stream.next() {
                Some(Ok(value)) => Ok((value, stream.byte_offset())),
                Some(Err(err)) => Err(err),
                None => return Ok(None),
            }
        };

        match parsed {
            Ok((value, consumed)) => {
                buf.consume(consumed)?;
                debug!(consumed, "decoded JSON object");
                Ok(Some(Frame::Object { value, consumed }))
            }
            Err(err) if err.is_eof() => Ok(None),
            Err(err) => {
                let consumed = malformed_len(buf.as_bytes(), &err);
                buf.consume(consumed)?;
                warn!(consumed, error = %err, "dropping malformed JSON object");
                Ok(Some(Frame::Malformed {
                    message: err.to_string(),
                    consumed,
                }))
            }
        }
    }
}

/// How much of a malformed object to drop: up to the offset serde_json
/// blamed, but never a later `{`, which may start the next message.
fn malformed_len(bytes: &[u8], err: &serde_json::Error) -> usize {
    let blamed = error_offset(bytes, err).clamp(1, bytes.len());
    bytes[1..blamed]
        .iter()
        .position(|&b| b == OBJECT_START)
        .map_or(blamed, |pos| pos + 1)
}

/// Byte offset just past the position serde_json blamed for `err`.
fn error_offset(bytes: &[u8], err: &serde_json::Error) -> usize {
    let mut line_start = 0usize;
    for _ in 1..err.line() {
        match bytes[line_start..].iter().position(|&b| b == b'\n') {
            Some(pos) => line_start += pos + 1,
            None => break,
        }
    }
    line_start + err.column()
}
