use std::path::Path;

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::DeviceStream;

/// Open a serial device node for reading and writing.
///
/// Line settings (baud rate, parity, stop bits) are the caller's concern and
/// must already be applied to the node, e.g. by the driver factory.
pub async fn open_device(path: impl AsRef<Path>) -> Result<DeviceStream> {
    let path = path.as_ref();
    let file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .await
        .map_err(|e| TransportError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;
    debug!(?path, "opened device node");
    Ok(DeviceStream::from_device(file))
}
