use std::io;
use std::path::PathBuf;

/// Failures while opening or using a labwire transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The control socket could not be created at `path`.
    #[error("cannot listen on control socket {path}: {source}")]
    Bind { path: PathBuf, source: io::Error },

    /// Something other than a socket already occupies the control socket path.
    #[error("refusing to replace {path}: not a unix socket")]
    NotASocket { path: PathBuf },

    #[error("cannot reach control socket {path}: {source}")]
    Connect { path: PathBuf, source: io::Error },

    /// The serial device node could not be opened for read/write.
    #[error("cannot open serial device {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("accepting a control connection failed: {0}")]
    Accept(io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// `sockaddr_un` cannot hold a path this long.
    #[error("control socket path is {len} bytes, the platform allows {max}: {path}")]
    PathTooLong { path: PathBuf, len: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, TransportError>;
