use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::DeviceStream;

#[cfg(target_os = "linux")]
const SUN_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
const SUN_PATH_LEN: usize = 104;

/// Device and inode of the socket file we created, so drop only removes
/// our own file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SocketIdentity {
    dev: u64,
    ino: u64,
}

impl SocketIdentity {
    fn of(path: &Path) -> Option<Self> {
        let meta = fs::symlink_metadata(path).ok()?;
        meta.file_type().is_socket().then(|| Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }
}

/// The control-plane listener a JSON-RPC server accepts clients on.
///
/// The socket file is removed again when the listener is dropped, unless
/// something else has taken over the path in the meantime.
#[derive(Debug)]
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    identity: Option<SocketIdentity>,
}

impl UnixDomainSocket {
    /// Owner read/write only.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Listen on `path`, replacing a leftover socket from a previous run.
    ///
    /// A regular file or directory at `path` is never touched. Needs a
    /// running Tokio runtime.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = path.as_os_str().len();
        if len >= SUN_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len,
                max: SUN_PATH_LEN,
            });
        }

        clear_stale_socket(&path)?;

        let bind_err = |source| TransportError::Bind {
            path: path.clone(),
            source,
        };
        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).map_err(bind_err)?;

        let identity = SocketIdentity::of(&path);
        info!(?path, mode = format_args!("{mode:o}"), "control socket listening");
        Ok(Self {
            listener,
            path,
            identity,
        })
    }

    pub async fn accept(&self) -> Result<DeviceStream> {
        let (stream, _) = self.listener.accept().await.map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "control client accepted");
        Ok(DeviceStream::from_unix(stream))
    }

    /// Dial a control socket as a client.
    pub async fn connect(path: impl AsRef<Path>) -> Result<DeviceStream> {
        let path = path.as_ref();
        match UnixStream::connect(path).await {
            Ok(stream) => {
                debug!(?path, "connected to control socket");
                Ok(DeviceStream::from_unix(stream))
            }
            Err(source) => Err(TransportError::Connect {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn clear_stale_socket(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(TransportError::Bind {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if !meta.file_type().is_socket() {
        return Err(TransportError::NotASocket {
            path: path.to_path_buf(),
        });
    }
    debug!(?path, "removing leftover control socket");
    fs::remove_file(path).map_err(|source| TransportError::Bind {
        path: path.to_path_buf(),
        source,
    })
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        let Some(ours) = self.identity else {
            return;
        };
        if SocketIdentity::of(&self.path) != Some(ours) {
            debug!(path = ?self.path, "control socket path was replaced, leaving it");
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = ?self.path, %err, "could not remove control socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        let dir = std::env::temp_dir().join(format!("lw-sock-{tag}-{}-{nanos}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn client_bytes_reach_the_accepted_stream() {
        let dir = scratch_dir("echo");
        let path = dir.join("ctl.sock");
        let socket = UnixDomainSocket::bind(&path).unwrap();

        let dial = path.clone();
        let client = tokio::spawn(async move {
            let mut stream = UnixDomainSocket::connect(&dial).await.unwrap();
            stream.write_all(b"G28\n").await.unwrap();
        });

        let mut accepted = socket.accept().await.unwrap();
        let mut got = [0u8; 4];
        accepted.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"G28\n");
        client.await.unwrap();

        drop(socket);
        assert!(!path.exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn overlong_path_is_rejected_before_binding() {
        let path = format!("/tmp/{}.sock", "x".repeat(SUN_PATH_LEN));
        assert!(matches!(
            UnixDomainSocket::bind(&path),
            Err(TransportError::PathTooLong { max: SUN_PATH_LEN, .. })
        ));
    }

    #[tokio::test]
    async fn socket_is_owner_only_by_default() {
        let dir = scratch_dir("mode");
        let path = dir.join("ctl.sock");
        let _socket = UnixDomainSocket::bind(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn leftover_socket_is_replaced_but_files_are_not() {
        let dir = scratch_dir("stale");
        let path = dir.join("ctl.sock");

        let first = UnixDomainSocket::bind(&path).unwrap();
        std::mem::forget(first);
        let second = UnixDomainSocket::bind(&path).unwrap();
        drop(second);

        fs::write(&path, b"calibration data").unwrap();
        assert!(matches!(
            UnixDomainSocket::bind(&path),
            Err(TransportError::NotASocket { .. })
        ));
        assert_eq!(fs::read(&path).unwrap(), b"calibration data");
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn replaced_path_survives_drop() {
        let dir = scratch_dir("swap");
        let path = dir.join("ctl.sock");
        let socket = UnixDomainSocket::bind(&path).unwrap();
        fs::remove_file(&path).unwrap();
        fs::write(&path, b"other").unwrap();

        drop(socket);
        assert!(path.exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn dialing_nothing_is_a_connect_error() {
        let dir = scratch_dir("absent");
        let result = UnixDomainSocket::connect(dir.join("nobody.sock")).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
        let _ = fs::remove_dir_all(&dir);
    }
}
