//! Connection lifecycle and per-connection dispatch.
//!
//! Each [`Connection`] is served by one task that exclusively owns the
//! transport, the frame decoder, the [`CorrelationTable`] and the timeout
//! queue. Handles talk to it over an unbounded channel and get their
//! outcome back over a oneshot, so no lock ever guards connection state.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use labwire_frame::{Frame, FrameCodec, FrameConfig, FrameError};
use labwire_marshal::MarshalRegistry;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, warn};

use crate::command::{Argument, Command, CommandEncoder};
use crate::config::{ConnectionConfig, DispatchConfig, LineKind, Protocol};
use crate::correlation::{Completion, CorrelationKey, CorrelationTable, PendingRequest, RequestId};
use crate::error::{DispatchError, RemoteError};
use crate::jsonrpc::{self, Inbound, RpcOutcome};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successful reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// JSON-RPC `result` member.
    Json(Value),
    /// Acknowledged device text with the ack token removed.
    Text(String),
}

impl Reply {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Reply::Json(value) => Some(value),
            Reply::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Reply::Text(text) => Some(text),
            Reply::Json(_) => None,
        }
    }

    /// The reply as a wire value; device text becomes a JSON string.
    pub fn into_value(self) -> Value {
        match self {
            Reply::Json(value) => value,
            Reply::Text(text) => Value::String(text),
        }
    }

    /// Unmarshal the reply through the registry entry for `tag`.
    pub fn decode_as<T: Any>(&self, registry: &MarshalRegistry, tag: &str) -> Result<T, DispatchError> {
        let decoded = match self {
            Reply::Json(value) => registry.deserialize_as::<T>(tag, value),
            Reply::Text(text) => registry.deserialize_as::<T>(tag, &Value::String(text.clone())),
        };
        decoded.map_err(|err| DispatchError::Decode(err.to_string()))
    }
}

struct Submission {
    request: RequestId,
    command: Command,
    completion: Completion,
}

impl Submission {
    fn reject(self, err: DispatchError) {
        let _ = self.completion.send(Err(err));
    }
}

enum Op {
    Submit(Submission),
    Cancel { request: RequestId, reason: String },
    Close,
}

struct Shared {
    id: ConnectionId,
    ops: mpsc::UnboundedSender<Op>,
    state: watch::Receiver<ConnectionState>,
    next_request: AtomicU64,
}

/// Handle to one live transport.
///
/// Cloning is cheap. When every handle and every outstanding
/// [`ReplyHandle`] is gone the connection closes itself.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Spawn the connection task for `transport`. Must be called inside a
    /// Tokio runtime.
    pub fn open<T>(transport: T, config: ConnectionConfig, registry: Arc<MarshalRegistry>) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(transport, config, registry, None)
    }

    /// Like [`Connection::open`], and sends the connection's id on
    /// `close_notify` once it has fully closed.
    pub fn open_with_close_notify<T>(
        transport: T,
        config: ConnectionConfig,
        registry: Arc<MarshalRegistry>,
        close_notify: mpsc::UnboundedSender<ConnectionId>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(transport, config, registry, Some(close_notify))
    }

    fn spawn<T>(
        transport: T,
        config: ConnectionConfig,
        registry: Arc<MarshalRegistry>,
        close_notify: Option<mpsc::UnboundedSender<ConnectionId>>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = ConnectionId::next();
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let dispatcher = Dispatcher::new(id, transport, config, registry, ops_rx, state_tx, close_notify);
        tokio::spawn(dispatcher.run());

        Self {
            shared: Arc::new(Shared {
                id,
                ops: ops_tx,
                state: state_rx,
                next_request: AtomicU64::new(1),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Queue `command` for transmission.
    ///
    /// Fails with [`DispatchError::Closed`] once the connection is closing.
    /// Every accepted command resolves its [`ReplyHandle`] exactly once.
    pub fn submit(&self, command: Command) -> Result<ReplyHandle, DispatchError> {
        if matches!(self.state(), ConnectionState::Closing | ConnectionState::Closed) {
            return Err(DispatchError::Closed);
        }

        let request = RequestId(self.shared.next_request.fetch_add(1, Ordering::Relaxed));
        let (completion, receiver) = oneshot::channel();
        self.shared
            .ops
            .send(Op::Submit(Submission {
                request,
                command,
                completion,
            }))
            .map_err(|_| DispatchError::Closed)?;

        Ok(ReplyHandle {
            request,
            receiver,
            ops: self.shared.ops.clone(),
            finished: false,
        })
    }

    /// Submit and wait for the outcome.
    pub async fn call(&self, command: Command) -> Result<Reply, DispatchError> {
        self.submit(command)?.await
    }

    /// Abandon a request. A no-op if it has already completed.
    pub fn cancel(&self, request: RequestId) {
        let _ = self.shared.ops.send(Op::Cancel {
            request,
            reason: "cancelled by caller".to_string(),
        });
    }

    /// Close the connection and wait until it is [`ConnectionState::Closed`].
    /// Safe to call any number of times.
    pub async fn close(&self) {
        let _ = self.shared.ops.send(Op::Close);
        self.closed().await;
    }

    /// Resolves once the connection is closed, for whatever reason.
    pub async fn closed(&self) {
        let mut state = self.shared.state.clone();
        let _ = state.wait_for(|state| *state == ConnectionState::Closed).await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Awaitable outcome of a submitted command.
///
/// Dropping it before completion cancels the request.
#[must_use = "dropping a ReplyHandle cancels its request"]
pub struct ReplyHandle {
    request: RequestId,
    receiver: oneshot::Receiver<Result<Reply, DispatchError>>,
    ops: mpsc::UnboundedSender<Op>,
    finished: bool,
}

impl ReplyHandle {
    pub fn request_id(&self) -> RequestId {
        self.request
    }
}

impl Future for ReplyHandle {
    type Output = Result<Reply, DispatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = ready!(Pin::new(&mut self.receiver).poll(cx));
        self.finished = true;
        Poll::Ready(outcome.unwrap_or(Err(DispatchError::Closed)))
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.ops.send(Op::Cancel {
                request: self.request,
                reason: "caller dropped the reply handle".to_string(),
            });
        }
    }
}

impl fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyHandle")
            .field("request", &self.request)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Open a connection over an already-established transport.
pub fn open_connection<T>(transport: T, config: ConnectionConfig, registry: Arc<MarshalRegistry>) -> Connection
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    Connection::open(transport, config, registry)
}

/// Submit `name` with `args` on `connection`.
pub fn submit_command(
    connection: &Connection,
    name: impl Into<String>,
    args: impl IntoIterator<Item = Argument>,
) -> Result<ReplyHandle, DispatchError> {
    connection.submit(Command::with_args(name, args))
}

pub async fn close_connection(connection: &Connection) {
    connection.close().await;
}

/// The task behind a [`Connection`].
struct Dispatcher<T> {
    id: ConnectionId,
    framed: Framed<T, FrameCodec>,
    ops: mpsc::UnboundedReceiver<Op>,
    state: watch::Sender<ConnectionState>,
    table: CorrelationTable,
    /// Line-protocol commands waiting for the device to free up.
    backlog: VecDeque<Submission>,
    timeouts: DelayQueue<CorrelationKey>,
    encoder: CommandEncoder,
    dispatch: DispatchConfig,
    frame: FrameConfig,
    close_notify: Option<mpsc::UnboundedSender<ConnectionId>>,
    partial_since: Option<Instant>,
}

impl<T> Dispatcher<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn new(
        id: ConnectionId,
        transport: T,
        config: ConnectionConfig,
        registry: Arc<MarshalRegistry>,
        ops: mpsc::UnboundedReceiver<Op>,
        state: watch::Sender<ConnectionState>,
        close_notify: Option<mpsc::UnboundedSender<ConnectionId>>,
    ) -> Self {
        let ConnectionConfig {
            protocol,
            dispatch,
            frame,
        } = config;
        let (codec, table) = match &protocol {
            Protocol::JsonRpc => (FrameCodec::json(), CorrelationTable::by_id()),
            Protocol::Line(line) => (FrameCodec::line(line.terminator.as_str()), CorrelationTable::strict()),
        };

        Self {
            id,
            framed: Framed::with_capacity(transport, codec, frame.read_chunk_size),
            ops,
            state,
            table,
            backlog: VecDeque::new(),
            timeouts: DelayQueue::new(),
            encoder: CommandEncoder::new(registry, protocol),
            dispatch,
            frame,
            close_notify,
            partial_since: None,
        }
    }

    async fn run(mut self) {
        self.state.send_replace(ConnectionState::Open);
        info!(
            connection = %self.id,
            protocol = if self.encoder.protocol().is_line() { "line" } else { "json-rpc" },
            "connection open"
        );
        let cause = self.serve().await;
        self.shutdown(cause).await;
    }

    /// Event loop. Returns the reason the connection has to close, or
    /// `None` for an orderly close.
    async fn serve(&mut self) -> Option<DispatchError> {
        let mut watchdog = self.watchdog();
        loop {
            let step = tokio::select! {
                op = self.ops.recv() => match op {
                    Some(Op::Close) => {
                        debug!(connection = %self.id, "close requested");
                        return None;
                    }
                    None => {
                        debug!(connection = %self.id, "every handle dropped");
                        return None;
                    }
                    Some(op) => self.handle_op(op).await,
                },
                frame = self.framed.next() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame).await,
                    Some(Err(err)) => Err(DispatchError::from(err)),
                    None => return Some(DispatchError::Transport("peer closed the connection".to_string())),
                },
                Some(expired) = self.timeouts.next(), if !self.timeouts.is_empty() => {
                    self.handle_timeout(expired.into_inner()).await
                }
                _ = tick(&mut watchdog), if watchdog.is_some() => self.check_partial_line(),
            };
            if let Err(err) = step {
                return Some(err);
            }
        }
    }

    async fn handle_op(&mut self, op: Op) -> Result<(), DispatchError> {
        match op {
            Op::Submit(submission) => self.submit(submission).await,
            Op::Cancel { request, reason } => self.cancel(request, reason).await,
            Op::Close => Ok(()),
        }
    }

    fn max_in_flight(&self) -> Option<usize> {
        self.encoder
            .protocol()
            .line()
            .map(|line| line.max_in_flight.max(1))
    }

    async fn submit(&mut self, submission: Submission) -> Result<(), DispatchError> {
        if let Some(limit) = self.max_in_flight() {
            if self.table.len() >= limit || !self.backlog.is_empty() {
                debug!(
                    connection = %self.id,
                    request = %submission.request,
                    method = %submission.command.name,
                    queued = self.backlog.len() + 1,
                    "device busy, queueing command"
                );
                self.backlog.push_back(submission);
                return Ok(());
            }
        }
        self.transmit(submission).await
    }

    async fn transmit(&mut self, submission: Submission) -> Result<(), DispatchError> {
        let Submission {
            request,
            command,
            completion,
        } = submission;
        let policy = command
            .policy
            .unwrap_or_else(|| self.dispatch.policy_for(command.class.as_deref()));

        let key = self.table.allocate_key();
        let payload = match self.encoder.encode(&command, key) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(connection = %self.id, method = %command.name, "command could not be encoded: {err}");
                let _ = completion.send(Err(DispatchError::Encode(err.to_string())));
                return Ok(());
            }
        };

        let pending = PendingRequest::new(key, request, command, payload, completion, policy, self.id);
        self.send_pending(pending).await
    }

    /// Register `pending`, arm its timeout, then write it.
    async fn send_pending(&mut self, mut pending: PendingRequest) -> Result<(), DispatchError> {
        let flush = self
            .encoder
            .protocol()
            .line()
            .is_some_and(|line| line.flush_stale_input);
        if flush && self.table.is_empty() {
            self.flush_stale_input();
        }

        let key = pending.key;
        let payload = pending.payload.clone();
        debug!(
            connection = %self.id,
            %key,
            method = %pending.method(),
            attempt = pending.attempts,
            bytes = payload.len(),
            "sending command"
        );
        pending.timeout_key = Some(self.timeouts.insert(key, pending.policy.timeout));
        // Registered before the write so a fast reply always finds it.
        self.table.register(pending)?;
        self.write(payload).await
    }

    async fn write(&mut self, payload: Bytes) -> Result<(), DispatchError> {
        self.frame.bounded_write(self.framed.send(payload)).await.map_err(DispatchError::from)
    }

    /// Drop partial input left over from an earlier exchange.
    fn flush_stale_input(&mut self) {
        let stale = self.framed.read_buffer().len();
        if stale > 0 {
            debug!(connection = %self.id, bytes = stale, "discarding stale device input");
            self.framed.read_buffer_mut().clear();
        }
        self.framed.codec_mut().reset();
        self.partial_since = None;
    }

    async fn cancel(&mut self, request: RequestId, reason: String) -> Result<(), DispatchError> {
        if let Some(pending) = self.table.take_request(request) {
            self.disarm(&pending);
            pending.complete(Err(DispatchError::Cancelled { reason }));
            return self.pump_backlog().await;
        }
        if let Some(index) = self.backlog.iter().position(|queued| queued.request == request) {
            if let Some(queued) = self.backlog.remove(index) {
                debug!(connection = %self.id, %request, "cancelled before transmission");
                queued.reject(DispatchError::Cancelled { reason });
            }
            return Ok(());
        }
        debug!(connection = %self.id, %request, "cancel arrived after completion");
        Ok(())
    }

    async fn handle_timeout(&mut self, key: CorrelationKey) -> Result<(), DispatchError> {
        let Some(mut pending) = self.table.take(&key) else {
            return Ok(());
        };
        pending.timeout_key = None;

        if pending.attempts <= pending.policy.retries {
            let fresh = self.table.allocate_key();
            match self.encoder.encode(&pending.command, fresh) {
                Ok(payload) => {
                    warn!(
                        connection = %self.id,
                        %key,
                        retry_key = %fresh,
                        method = %pending.method(),
                        attempt = pending.attempts + 1,
                        "no reply in time, retrying"
                    );
                    pending.retarget(fresh, payload);
                    return self.send_pending(pending).await;
                }
                Err(err) => pending.complete(Err(DispatchError::Encode(err.to_string()))),
            }
        } else {
            let timeout = pending.policy.timeout;
            let attempts = pending.attempts;
            warn!(
                connection = %self.id,
                %key,
                method = %pending.method(),
                attempts,
                "no reply in time"
            );
            pending.complete(Err(DispatchError::Timeout { timeout, attempts }));
        }
        self.pump_backlog().await
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), DispatchError> {
        match frame {
            Frame::Object { value, consumed } => {
                debug!(connection = %self.id, bytes = consumed, "received object");
                self.resolve_object(value);
                Ok(())
            }
            Frame::Line(line) => {
                self.partial_since = None;
                self.resolve_line(line).await
            }
            Frame::Malformed { message, consumed } => {
                warn!(connection = %self.id, bytes = consumed, "discarding malformed reply: {message}");
                Ok(())
            }
        }
    }

    fn resolve_object(&mut self, value: Value) {
        let parts = match jsonrpc::classify(value) {
            Inbound::Response(parts) => parts,
            Inbound::Request(request) => {
                warn!(connection = %self.id, method = %request.method, "ignoring request sent to a client");
                return;
            }
            Inbound::Invalid(reason) => {
                warn!(connection = %self.id, "ignoring unrecognised message: {reason}");
                return;
            }
        };

        let Some(key) = parts.id.as_u64().map(CorrelationKey::Id) else {
            warn!(connection = %self.id, id = %parts.id, outcome = ?parts.outcome, "orphan reply without a usable id");
            return;
        };
        let Some(pending) = self.table.take(&key) else {
            warn!(connection = %self.id, %key, "orphan reply");
            return;
        };
        self.disarm(&pending);

        let result = match parts.outcome {
            Ok(RpcOutcome::Result(value)) => Ok(Reply::Json(value)),
            Ok(RpcOutcome::Error(error)) => Err(DispatchError::Remote(RemoteError::Rpc {
                code: error.code,
                message: error.message,
                data: error.data,
            })),
            Err(reason) => Err(DispatchError::Decode(reason)),
        };
        pending.complete(result);
    }

    /// Attribute a device line to the oldest pending request.
    async fn resolve_line(&mut self, line: String) -> Result<(), DispatchError> {
        let Some(protocol) = self.encoder.protocol().line() else {
            return Ok(());
        };
        let kind = protocol.classify(&line);

        let Some(oldest) = self.table.oldest_mut() else {
            if !line.trim().is_empty() {
                warn!(connection = %self.id, line = %line, "orphan device line");
            }
            return Ok(());
        };
        debug!(connection = %self.id, key = %oldest.key, line = %line, "device line");

        let acked = match kind {
            LineKind::Data => {
                if !line.trim().is_empty() {
                    oldest.lines.push(line);
                }
                return Ok(());
            }
            LineKind::Ack => {
                oldest.lines.push(protocol.strip_ack(&line));
                true
            }
            LineKind::Error => {
                oldest.lines.push(line);
                false
            }
        };

        let Some(pending) = self.table.take_oldest() else {
            return Ok(());
        };
        self.disarm(&pending);

        let text = pending
            .lines
            .iter()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if acked {
            pending.complete(Ok(Reply::Text(text)));
        } else {
            pending.complete(Err(DispatchError::Remote(RemoteError::Device { text })));
        }
        self.pump_backlog().await
    }

    /// Transmit queued commands while the device has room.
    async fn pump_backlog(&mut self) -> Result<(), DispatchError> {
        let Some(limit) = self.max_in_flight() else {
            return Ok(());
        };
        while self.table.len() < limit {
            let Some(next) = self.backlog.pop_front() else {
                break;
            };
            self.transmit(next).await?;
        }
        Ok(())
    }

    fn disarm(&mut self, pending: &PendingRequest) {
        if let Some(timeout_key) = &pending.timeout_key {
            let _ = self.timeouts.try_remove(timeout_key);
        }
    }

    /// Partial-line watchdog, only for line protocols with a read timeout.
    fn watchdog(&self) -> Option<Interval> {
        if !self.encoder.protocol().is_line() {
            return None;
        }
        let limit = self.frame.read_timeout?;
        let period = (limit / 4).max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(interval)
    }

    fn check_partial_line(&mut self) -> Result<(), DispatchError> {
        let Some(limit) = self.frame.read_timeout else {
            return Ok(());
        };
        let buffered = self.framed.read_buffer().len();
        if buffered == 0 {
            self.partial_since = None;
            return Ok(());
        }
        let since = *self.partial_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= limit {
            return Err(DispatchError::Decode(format!(
                "partial line of {buffered} bytes left unterminated for {:?}",
                since.elapsed()
            )));
        }
        Ok(())
    }

    async fn shutdown(mut self, cause: Option<DispatchError>) {
        self.state.send_replace(ConnectionState::Closing);
        self.ops.close();

        let reason = match &cause {
            Some(err) if err.is_invariant_violation() => {
                error!(connection = %self.id, "closing after invariant violation: {err}");
                format!("connection closed: {err}")
            }
            Some(err) => {
                info!(connection = %self.id, "closing: {err}");
                format!("connection closed: {err}")
            }
            None => "connection closed".to_string(),
        };

        let mut cancelled = 0usize;
        while let Ok(op) = self.ops.try_recv() {
            if let Op::Submit(submission) = op {
                submission.reject(DispatchError::cancelled(reason.as_str()));
                cancelled += 1;
            }
        }
        for pending in self.table.drain() {
            pending.complete(Err(DispatchError::cancelled(reason.as_str())));
            cancelled += 1;
        }
        for queued in self.backlog.drain(..) {
            queued.reject(DispatchError::cancelled(reason.as_str()));
            cancelled += 1;
        }
        self.timeouts.clear();

        let closed: Result<(), FrameError> = self.frame.bounded_write(self.framed.close()).await;
        if let Err(err) = closed {
            debug!(connection = %self.id, "transport shutdown failed: {err}");
        }

        self.state.send_replace(ConnectionState::Closed);
        info!(connection = %self.id, cancelled, "connection closed");
        if let Some(notify) = self.close_notify.take() {
            let _ = notify.send(self.id);
        }
    }
}

async fn tick(watchdog: &mut Option<Interval>) {
    match watchdog {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
