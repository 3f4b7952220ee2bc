//! Byte stream buffering and message framing for labwire.
//!
//! Two framing modes are supported over the same [`ByteStreamBuffer`]:
//! - balanced JSON objects with garbage resynchronization (JSON-RPC over a
//!   stream socket), see [`JsonObjectDecoder`]
//! - terminator-delimited text lines (gcode-style ack protocols on serial
//!   devices), see [`LineDecoder`]
//!
//! Callers always get complete [`Frame`]s; partial input stays buffered.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod json;
pub mod line;

pub use buffer::ByteStreamBuffer;
pub use codec::{Frame, FrameCodec, FrameDecoder};
pub use config::{FrameConfig, DEFAULT_READ_CHUNK_SIZE, DEFAULT_WRITE_TIMEOUT};
pub use error::{FrameError, Result};
pub use json::JsonObjectDecoder;
pub use line::LineDecoder;
