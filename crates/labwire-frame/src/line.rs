use tracing::trace;

use crate::buffer::ByteStreamBuffer;
use crate::codec::Frame;
use crate::error::Result;

/// Splits a byte stream into terminator-delimited text lines.
///
/// The terminator may be several bytes long (`\r\n` for most firmware).
/// `scan_from` remembers how far the previous search got so repeated calls
/// on a slowly growing buffer do not rescan from the start.
#[derive(Debug, Clone)]
pub struct LineDecoder {
    terminator: Vec<u8>,
    scan_from: usize,
}

impl LineDecoder {
    pub fn new(terminator: impl Into<Vec<u8>>) -> Self {
        Self {
            terminator: terminator.into(),
            scan_from: 0,
        }
    }

    pub fn terminator(&self) -> &[u8] {
        &self.terminator
    }

    /// Forget scan progress. Call after the buffer is cleared externally.
    pub fn reset(&mut self) {
        self.scan_from = 0;
    }

    /// Try to extract one line from the front of `buf`.
    ///
    /// The terminator is stripped; the body is decoded as lossy UTF-8.
    pub fn decode(&mut self, buf: &mut ByteStreamBuffer) -> Result<Option<Frame>> {
        let Some(pos) = buf.find(&self.terminator, self.scan_from) else {
            // Rescan the tail next time in case the terminator straddles the boundary.
            self.scan_from = buf.len().saturating_sub(self.terminator.len().saturating_sub(1));
            return Ok(None);
        };

        let line = buf.consume(pos)?;
        buf.consume(self.terminator.len())?;
        self.scan_from = 0;

        let text = String::from_utf8_lossy(&line).into_owned();
        trace!(line = %text, "decoded line");
        Ok(Some(Frame::Line(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(frame: Option<Frame>) -> String {
        match frame {
            Some(Frame::Line(text)) => text,
            other => panic!("expected line frame, got {other:?}"),
        }
    }

    #[test]
    fn splits_on_crlf() {
        let mut decoder = LineDecoder::new("\r\n");
        let mut buf = ByteStreamBuffer::new();
        buf.append(b"M105 T:37.0 C:37.0\r\nok\r\n");

        assert_eq!(line(decoder.decode(&mut buf).unwrap()), "M105 T:37.0 C:37.0");
        assert_eq!(line(decoder.decode(&mut buf).unwrap()), "ok");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_terminator_then_emits() {
        let mut decoder = LineDecoder::new("\n");
        let mut buf = ByteStreamBuffer::new();
        buf.append(b"ok");

        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.as_bytes(), b"ok");

        buf.append(b"\n");
        assert_eq!(line(decoder.decode(&mut buf).unwrap()), "ok");
    }

    #[test]
    fn terminator_split_across_reads() {
        let mut decoder = LineDecoder::new("\r\n");
        let mut buf = ByteStreamBuffer::new();
        buf.append(b"OK\r");
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.append(b"\n");
        assert_eq!(line(decoder.decode(&mut buf).unwrap()), "OK");
    }

    #[test]
    fn empty_line_is_a_frame() {
        let mut decoder = LineDecoder::new("\r\n");
        let mut buf = ByteStreamBuffer::new();
        buf.append(b"\r\nok\r\n");

        assert_eq!(line(decoder.decode(&mut buf).unwrap()), "");
        assert_eq!(line(decoder.decode(&mut buf).unwrap()), "ok");
    }

    #[test]
    fn reset_after_external_clear() {
        let mut decoder = LineDecoder::new("\n");
        let mut buf = ByteStreamBuffer::new();
        buf.append(b"stale partial line");
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.clear();
        decoder.reset();
        buf.append(b"ok\n");
        assert_eq!(line(decoder.decode(&mut buf).unwrap()), "ok");
    }
}
