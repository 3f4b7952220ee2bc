use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Which transport a [`DeviceStream`] wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Unix domain socket peer.
    Unix,
    /// Serial device node.
    Device,
}

impl StreamKind {
    /// Transport name for diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Unix => "unix-domain-socket",
            StreamKind::Device => "serial-device",
        }
    }
}

/// Credentials of a connected socket peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
}

/// A connected, already-open transport implementing `AsyncRead + AsyncWrite`.
///
/// This is the fundamental I/O type handed to the protocol core. The core
/// never configures the transport (baud rate, socket options); it receives
/// the handle ready to use.
pub struct DeviceStream {
    inner: DeviceStreamInner,
}

enum DeviceStreamInner {
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    Device(tokio::fs::File),
}

impl DeviceStream {
    /// Wrap a connected Unix domain socket stream.
    #[cfg(unix)]
    pub fn from_unix(stream: tokio::net::UnixStream) -> Self {
        Self {
            inner: DeviceStreamInner::Unix(stream),
        }
    }

    /// Wrap an opened device node.
    pub fn from_device(file: tokio::fs::File) -> Self {
        Self {
            inner: DeviceStreamInner::Device(file),
        }
    }

    /// Which transport this stream wraps.
    pub fn kind(&self) -> StreamKind {
        match &self.inner {
            #[cfg(unix)]
            DeviceStreamInner::Unix(_) => StreamKind::Unix,
            DeviceStreamInner::Device(_) => StreamKind::Device,
        }
    }

    /// Get the credentials of the connected socket peer.
    ///
    /// Returns `None` for device nodes or when the platform does not expose them.
    pub fn peer_credentials(&self) -> Option<PeerCredentials> {
        match &self.inner {
            #[cfg(unix)]
            DeviceStreamInner::Unix(stream) => {
                let cred = stream.peer_cred().ok()?;
                Some(PeerCredentials {
                    uid: cred.uid(),
                    gid: cred.gid(),
                    pid: cred.pid(),
                })
            }
            DeviceStreamInner::Device(_) => None,
        }
    }
}

impl AsyncRead for DeviceStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            DeviceStreamInner::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            DeviceStreamInner::Device(file) => Pin::new(file).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DeviceStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            DeviceStreamInner::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            DeviceStreamInner::Device(file) => Pin::new(file).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            DeviceStreamInner::Unix(stream) => Pin::new(stream).poll_flush(cx),
            DeviceStreamInner::Device(file) => Pin::new(file).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            DeviceStreamInner::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            DeviceStreamInner::Device(file) => Pin::new(file).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for DeviceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStream")
            .field("type", &self.kind().as_str())
            .finish()
    }
}
