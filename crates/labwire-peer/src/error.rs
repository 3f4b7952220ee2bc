use std::time::Duration;

use serde_json::Value;

use crate::correlation::CorrelationKey;

/// Errors that can occur setting up or serving peers.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] labwire_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] labwire_frame::FrameError),

    /// Marshalling error.
    #[error("marshal error: {0}")]
    Marshal(#[from] labwire_marshal::MarshalError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A command failed after it was submitted.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// A command could not be rendered for the wire.
    #[error("encode error: {0}")]
    Encode(String),

    /// A method name was registered twice.
    #[error("method {0:?} already registered")]
    DuplicateMethod(String),

    /// `bind` was called while a previous accept loop is still running.
    #[error("server is already running")]
    ServerRunning,

    /// A settings file could not be loaded.
    #[error("invalid settings: {0}")]
    Settings(String),
}

pub type Result<T> = std::result::Result<T, PeerError>;

/// Coarse classification of a [`DispatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Decode,
    Timeout,
    Cancelled,
    Remote,
    Transport,
    Invariant,
    Encode,
    Closed,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Decode => "decode",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Remote => "remote",
            ErrorKind::Transport => "transport",
            ErrorKind::Invariant => "invariant",
            ErrorKind::Encode => "encode",
            ErrorKind::Closed => "closed",
        }
    }
}

/// An error reply sent by the remote side.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    /// JSON-RPC error object.
    #[error("remote error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Device error line, verbatim.
    #[error("device error: {text}")]
    Device { text: String },
}

/// Outcome delivered to a caller whose command did not succeed.
///
/// Every submitted command resolves to exactly one of these or a reply.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    /// The reply could not be interpreted.
    #[error("decode error: {0}")]
    Decode(String),

    /// No reply arrived within the timeout on any attempt.
    #[error("no reply after {attempts} attempt(s) of {timeout:?}")]
    Timeout { timeout: Duration, attempts: u32 },

    /// The caller or the connection abandoned the request.
    #[error("request cancelled: {reason}")]
    Cancelled { reason: String },

    /// The remote side answered with an error.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Reading from or writing to the transport failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A decoder consumed more bytes than were buffered.
    #[error("buffer underrun (requested {requested} bytes, {available} available)")]
    BufferUnderrun { requested: usize, available: usize },

    /// A correlation key was registered twice on one connection.
    #[error("duplicate correlation key {0}")]
    DuplicateCorrelationKey(CorrelationKey),

    /// The command could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// The connection is closing or closed.
    #[error("connection closed")]
    Closed,
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Decode(_) => ErrorKind::Decode,
            DispatchError::Timeout { .. } => ErrorKind::Timeout,
            DispatchError::Cancelled { .. } => ErrorKind::Cancelled,
            DispatchError::Remote(_) => ErrorKind::Remote,
            DispatchError::Transport(_) => ErrorKind::Transport,
            DispatchError::BufferUnderrun { .. } | DispatchError::DuplicateCorrelationKey(_) => {
                ErrorKind::Invariant
            }
            DispatchError::Encode(_) => ErrorKind::Encode,
            DispatchError::Closed => ErrorKind::Closed,
        }
    }

    /// Whether this error means the connection's own state is corrupt.
    pub fn is_invariant_violation(&self) -> bool {
        self.kind() == ErrorKind::Invariant
    }

    pub(crate) fn cancelled(reason: impl Into<String>) -> Self {
        DispatchError::Cancelled {
            reason: reason.into(),
        }
    }
}

impl From<labwire_frame::FrameError> for DispatchError {
    fn from(err: labwire_frame::FrameError) -> Self {
        match err {
            labwire_frame::FrameError::BufferUnderrun {
                requested,
                available,
            } => DispatchError::BufferUnderrun {
                requested,
                available,
            },
            other => DispatchError::Transport(other.to_string()),
        }
    }
}
