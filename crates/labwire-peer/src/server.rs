//! JSON-RPC 2.0 server over Unix domain sockets.
//!
//! An accept loop owns the set of live connections. Each connection reads
//! Mode A frames and runs every request as its own task, so a slow method
//! never blocks the socket. A panicking handler is reported to the caller
//! instead of killing the connection.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{FutureExt, SinkExt, StreamExt};
use labwire_frame::{Frame, FrameCodec, FrameError};
use labwire_marshal::MarshalRegistry;
use labwire_transport::{DeviceStream, UnixDomainSocket};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::ConnectionId;
use crate::error::{PeerError, Result};
use crate::jsonrpc::{self, Inbound, RpcRequest, RpcResponse};
use crate::methods::{MethodError, MethodRegistry};

struct ServerInner {
    methods: MethodRegistry,
    registry: Arc<MarshalRegistry>,
    config: ServerConfig,
    running: AtomicBool,
}

/// Serves a [`MethodRegistry`] to JSON-RPC clients.
#[derive(Clone)]
pub struct JsonRpcServer {
    inner: Arc<ServerInner>,
}

impl JsonRpcServer {
    pub fn new(methods: MethodRegistry, registry: Arc<MarshalRegistry>, config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                methods,
                registry,
                config,
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn methods(&self) -> &MethodRegistry {
        &self.inner.methods
    }

    /// Listen on `path` and serve every accepted connection.
    ///
    /// Fails with [`PeerError::ServerRunning`] while an earlier accept loop
    /// of this server is still running.
    pub fn bind(&self, path: impl AsRef<Path>) -> Result<ServerHandle> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PeerError::ServerRunning);
        }

        let socket = match UnixDomainSocket::bind_with_mode(path, self.inner.config.socket_mode) {
            Ok(socket) => socket,
            Err(err) => {
                self.inner.running.store(false, Ordering::Release);
                return Err(err.into());
            }
        };
        let path = socket.path().to_path_buf();
        let (stop_tx, stop_rx) = watch::channel(false);
        let connections = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn(accept_loop(self.clone(), socket, stop_rx, Arc::clone(&connections)));
        info!(?path, methods = self.inner.methods.names().len(), "json-rpc server started");

        Ok(ServerHandle {
            path,
            connections,
            stop: stop_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Serve one already-open transport.
    ///
    /// The connection runs until the peer hangs up or the returned handle
    /// is closed or dropped.
    pub fn serve<T>(&self, transport: T) -> ServerConnection
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.spawn_connection(transport, None)
    }

    fn spawn_connection<T>(
        &self,
        transport: T,
        close_notify: Option<mpsc::UnboundedSender<ConnectionId>>,
    ) -> ServerConnection
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = ConnectionId::next();
        let (stop_tx, stop_rx) = watch::channel(false);
        let session = Session {
            id,
            framed: Framed::with_capacity(transport, FrameCodec::json(), self.inner.config.frame.read_chunk_size),
            inner: Arc::clone(&self.inner),
            tasks: JoinSet::new(),
            in_flight: HashSet::new(),
        };
        let task = tokio::spawn(session.run(stop_rx, close_notify));
        ServerConnection {
            id,
            stop: stop_tx,
            task,
        }
    }
}

impl std::fmt::Debug for JsonRpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcServer")
            .field("methods", &self.inner.methods)
            .field("config", &self.inner.config)
            .field("running", &self.inner.running.load(Ordering::Relaxed))
            .finish()
    }
}

/// Handle to a running accept loop. Dropping it stops the server.
#[derive(Debug)]
pub struct ServerHandle {
    path: PathBuf,
    connections: Arc<AtomicUsize>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Stop accepting, close every connection and remove the socket file.
    /// Later calls wait for the first to finish and then return.
    pub async fn stop(&self) {
        let _ = self.stop.send(true);
        let mut task = self.task.lock().await;
        if let Some(task) = task.take() {
            if let Err(err) = task.await {
                warn!(path = ?self.path, "accept loop ended abnormally: {err}");
            }
        }
    }
}

/// One connection being served.
#[derive(Debug)]
pub struct ServerConnection {
    id: ConnectionId,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel in-flight calls and close the transport.
    pub async fn close(self) {
        let _ = self.stop.send(true);
        self.join().await;
    }

    /// Wait for the connection to end on its own.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!(connection = %self.id, "connection task ended abnormally: {err}");
        }
    }
}

async fn accept_loop(
    server: JsonRpcServer,
    socket: UnixDomainSocket,
    mut stop: watch::Receiver<bool>,
    count: Arc<AtomicUsize>,
) {
    let max_connections = server.inner.config.max_connections;
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let mut connections: HashMap<ConnectionId, ServerConnection> = HashMap::new();

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = socket.accept() => match accepted {
                Ok(stream) => {
                    if connections.len() >= max_connections {
                        warn!(path = ?socket.path(), max_connections, "rejecting connection: at capacity");
                        continue;
                    }
                    let peer = stream.peer_credentials();
                    let connection = server.spawn_connection::<DeviceStream>(stream, Some(closed_tx.clone()));
                    info!(connection = %connection.id(), ?peer, "accepted connection");
                    connections.insert(connection.id(), connection);
                    count.store(connections.len(), Ordering::Release);
                }
                Err(err) => error!(path = ?socket.path(), "accept failed: {err}"),
            },
            Some(id) = closed_rx.recv() => {
                connections.remove(&id);
                count.store(connections.len(), Ordering::Release);
                debug!(connection = %id, remaining = connections.len(), "connection unregistered");
            }
        }
    }

    info!(path = ?socket.path(), connections = connections.len(), "json-rpc server stopping");
    for (_, connection) in connections.drain() {
        connection.close().await;
    }
    count.store(0, Ordering::Release);
    drop(socket);
    server.inner.running.store(false, Ordering::Release);
}

/// What a finished dispatch task hands back to its connection.
struct Dispatched {
    id: Option<Value>,
    method: String,
    result: std::result::Result<Value, MethodError>,
}

/// Server side of one connection.
struct Session<T> {
    id: ConnectionId,
    framed: Framed<T, FrameCodec>,
    inner: Arc<ServerInner>,
    tasks: JoinSet<Dispatched>,
    /// Ids of requests still executing, as canonical JSON text.
    in_flight: HashSet<String>,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(
        mut self,
        mut stop: watch::Receiver<bool>,
        close_notify: Option<mpsc::UnboundedSender<ConnectionId>>,
    ) {
        debug!(connection = %self.id, "serving connection");
        loop {
            let step = tokio::select! {
                _ = stop.changed() => {
                    debug!(connection = %self.id, "server closing connection");
                    break;
                }
                frame = self.framed.next() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame).await,
                    Some(Err(err)) => Err(err),
                    None => {
                        debug!(connection = %self.id, "peer hung up");
                        break;
                    }
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
                    Ok(dispatched) => self.finish(dispatched).await,
                    Err(err) => {
                        debug!(connection = %self.id, "dispatch task did not finish: {err}");
                        Ok(())
                    }
                },
            };
            if let Err(err) = step {
                warn!(connection = %self.id, "closing connection: {err}");
                break;
            }
        }

        let abandoned = self.tasks.len();
        self.tasks.shutdown().await;
        if abandoned > 0 {
            info!(connection = %self.id, abandoned, "cancelled in-flight calls");
        }
        let frame = &self.inner.config.frame;
        if let Err(err) = frame.bounded_write(self.framed.close()).await {
            debug!(connection = %self.id, "transport shutdown failed: {err}");
        }
        info!(connection = %self.id, "connection closed");
        if let Some(notify) = close_notify {
            let _ = notify.send(self.id);
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> std::result::Result<(), FrameError> {
        match frame {
            Frame::Object { value, .. } => match jsonrpc::classify(value) {
                Inbound::Request(request) => self.dispatch(request).await,
                Inbound::Response(parts) => {
                    self.respond(parts.id, MethodError::invalid_request("expected a request, got a response"))
                        .await
                }
                Inbound::Invalid(reason) => {
                    self.respond(Value::Null, MethodError::invalid_request(reason)).await
                }
            },
            Frame::Malformed { message, consumed } => {
                warn!(connection = %self.id, bytes = consumed, "unparseable request: {message}");
                self.respond(Value::Null, MethodError::parse_error(message)).await
            }
            Frame::Line(line) => {
                self.respond(Value::Null, MethodError::invalid_request(format!("unexpected text {line:?}")))
                    .await
            }
        }
    }

    async fn dispatch(&mut self, request: RpcRequest) -> std::result::Result<(), FrameError> {
        if let Some(id) = &request.id {
            if !self.in_flight.insert(id.to_string()) {
                warn!(connection = %self.id, %id, method = %request.method, "request id already in flight");
                return self
                    .respond(id.clone(), MethodError::invalid_request("request id already in flight"))
                    .await;
            }
        }

        let inner = Arc::clone(&self.inner);
        let connection = self.id;
        self.tasks.spawn(async move {
            let RpcRequest { id, method, params, .. } = request;
            let call = async {
                let prepared = inner.methods.prepare(&method, params, &inner.registry)?;
                prepared.run(&inner.registry).await
            };
            let result = match AssertUnwindSafe(call).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let detail = panic_message(panic.as_ref());
                    error!(%connection, %method, "method panicked: {detail}");
                    Err(MethodError::dispatch_exception(detail))
                }
            };
            Dispatched { id, method, result }
        });
        Ok(())
    }

    async fn finish(&mut self, dispatched: Dispatched) -> std::result::Result<(), FrameError> {
        let Dispatched { id, method, result } = dispatched;
        let Some(id) = id else {
            if let Err(err) = result {
                debug!(connection = %self.id, %method, "notification failed: {err}");
            }
            return Ok(());
        };
        self.in_flight.remove(&id.to_string());

        let response = match result {
            Ok(value) => RpcResponse::success(id, value),
            Err(err) => {
                debug!(connection = %self.id, %method, code = err.code, "call failed: {err}");
                RpcResponse::failure(id, err.into())
            }
        };
        self.write(&response).await
    }

    async fn respond(&mut self, id: Value, error: MethodError) -> std::result::Result<(), FrameError> {
        self.write(&RpcResponse::failure(id, error.into())).await
    }

    async fn write(&mut self, response: &RpcResponse) -> std::result::Result<(), FrameError> {
        let bytes = match response.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(connection = %self.id, "response could not be serialized: {err}");
                let fallback = RpcResponse::failure(response.id.clone(), MethodError::internal(err).into());
                fallback.to_bytes().map_err(|err| FrameError::Io(err.into()))?
            }
        };
        self.inner.config.frame.bounded_write(self.framed.send(bytes)).await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "method panicked".to_string()
    }
}
