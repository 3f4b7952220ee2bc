/// Errors that can occur while buffering or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A caller asked to consume more bytes than are buffered.
    ///
    /// This is an invariant violation: decoders only consume what they have
    /// already confirmed is present.
    #[error("buffer underrun (requested {requested} bytes, {available} available)")]
    BufferUnderrun { requested: usize, available: usize },

    /// An I/O error occurred while reading frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;
