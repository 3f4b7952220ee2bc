use std::path::Path;
use std::sync::Arc;

use labwire_marshal::MarshalRegistry;
use labwire_transport::UnixDomainSocket;
use tracing::info;

use crate::config::{ConnectionConfig, LineProtocol, Protocol};
use crate::connection::Connection;
use crate::error::Result;

/// Connect to a JSON-RPC server listening on a Unix socket.
///
/// `config.protocol` is forced to JSON-RPC.
pub async fn connect(
    path: impl AsRef<Path>,
    config: ConnectionConfig,
    registry: Arc<MarshalRegistry>,
) -> Result<Connection> {
    let path = path.as_ref();
    let stream = UnixDomainSocket::connect(path).await?;
    let config = ConnectionConfig {
        protocol: Protocol::JsonRpc,
        ..config
    };
    let connection = Connection::open(stream, config, registry);
    info!(connection = %connection.id(), ?path, "connected to json-rpc server");
    Ok(connection)
}

/// Open a line-protocol device node such as `/dev/ttyACM0`.
///
/// Baud rate and line discipline must already be configured.
pub async fn open_device(
    path: impl AsRef<Path>,
    protocol: LineProtocol,
    config: ConnectionConfig,
    registry: Arc<MarshalRegistry>,
) -> Result<Connection> {
    let path = path.as_ref();
    let stream = labwire_transport::open_device(path).await?;
    let config = ConnectionConfig {
        protocol: Protocol::Line(protocol),
        ..config
    };
    let connection = Connection::open(stream, config, registry);
    info!(connection = %connection.id(), ?path, "opened device");
    Ok(connection)
}
