//! In-flight request bookkeeping for one connection.
//!
//! A [`CorrelationTable`] is owned by the connection task and never shared,
//! so it needs no locking. Every [`PendingRequest`] is completed exactly
//! once: by its reply, its timeout, a cancellation or connection teardown.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::time::delay_queue;
use tracing::{debug, error};

use crate::command::Command;
use crate::config::CommandPolicy;
use crate::connection::{ConnectionId, Reply};
use crate::error::DispatchError;

/// Identifies the reply a pending request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CorrelationKey {
    /// Explicit JSON-RPC `id`.
    Id(u64),
    /// Position in the send order of a line protocol.
    Seq(u64),
}

impl CorrelationKey {
    pub fn value(self) -> u64 {
        match self {
            CorrelationKey::Id(value) | CorrelationKey::Seq(value) => value,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationKey::Id(id) => write!(f, "id:{id}"),
            CorrelationKey::Seq(seq) => write!(f, "seq:{seq}"),
        }
    }
}

/// Caller-facing identity of a submitted command. Unlike the
/// [`CorrelationKey`], it survives retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

pub type Completion = oneshot::Sender<Result<Reply, DispatchError>>;

/// One outstanding command awaiting its reply.
pub struct PendingRequest {
    pub(crate) key: CorrelationKey,
    pub(crate) request: RequestId,
    pub(crate) command: Command,
    pub(crate) payload: Bytes,
    completion: Completion,
    pub(crate) submitted_at: Instant,
    pub(crate) attempts: u32,
    pub(crate) policy: CommandPolicy,
    pub(crate) timeout_key: Option<delay_queue::Key>,
    pub(crate) connection: ConnectionId,
    /// Reply lines received so far (line protocols only).
    pub(crate) lines: Vec<String>,
}

impl PendingRequest {
    pub fn new(
        key: CorrelationKey,
        request: RequestId,
        command: Command,
        payload: Bytes,
        completion: Completion,
        policy: CommandPolicy,
        connection: ConnectionId,
    ) -> Self {
        Self {
            key,
            request,
            command,
            payload,
            completion,
            submitted_at: Instant::now(),
            attempts: 1,
            policy,
            timeout_key: None,
            connection,
            lines: Vec::new(),
        }
    }

    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    pub fn request(&self) -> RequestId {
        self.request
    }

    pub fn method(&self) -> &str {
        &self.command.name
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Move to a fresh key for a re-transmission.
    pub(crate) fn retarget(&mut self, key: CorrelationKey, payload: Bytes) {
        self.key = key;
        self.payload = payload;
        self.attempts += 1;
        self.timeout_key = None;
        self.lines.clear();
    }

    /// Deliver the outcome to the caller.
    pub fn complete(self, result: Result<Reply, DispatchError>) {
        let elapsed = self.submitted_at.elapsed();
        match &result {
            Ok(_) => debug!(
                connection = %self.connection,
                key = %self.key,
                method = %self.command.name,
                attempt = self.attempts,
                ?elapsed,
                "request completed"
            ),
            Err(err) => debug!(
                connection = %self.connection,
                key = %self.key,
                method = %self.command.name,
                attempt = self.attempts,
                kind = err.kind().as_str(),
                "request failed: {err}"
            ),
        }

        if let Err(Err(err)) = self.completion.send(result) {
            debug!(
                connection = %self.connection,
                key = %self.key,
                "caller went away before the error could be delivered: {err}"
            );
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("key", &self.key)
            .field("request", &self.request)
            .field("method", &self.command.name)
            .field("attempts", &self.attempts)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ordering {
    ById,
    Strict,
}

/// Pending requests of one connection keyed by [`CorrelationKey`].
///
/// Keys come from a per-table counter, so iteration order is send order.
#[derive(Debug)]
pub struct CorrelationTable {
    ordering: Ordering,
    next: u64,
    entries: BTreeMap<CorrelationKey, PendingRequest>,
}

impl CorrelationTable {
    /// Replies carry the request id.
    pub fn by_id() -> Self {
        Self::with_ordering(Ordering::ById)
    }

    /// Replies arrive in send order.
    pub fn strict() -> Self {
        Self::with_ordering(Ordering::Strict)
    }

    fn with_ordering(ordering: Ordering) -> Self {
        Self {
            ordering,
            next: 0,
            entries: BTreeMap::new(),
        }
    }

    pub fn allocate_key(&mut self) -> CorrelationKey {
        self.next += 1;
        match self.ordering {
            Ordering::ById => CorrelationKey::Id(self.next),
            Ordering::Strict => CorrelationKey::Seq(self.next),
        }
    }

    /// Track `pending` until its reply arrives.
    ///
    /// A key already in use is fatal for the connection; the new request is
    /// failed on the spot and the error is returned so the owner can close.
    pub fn register(&mut self, pending: PendingRequest) -> Result<(), DispatchError> {
        let key = pending.key;
        if self.entries.contains_key(&key) {
            error!(connection = %pending.connection, %key, "correlation key already in use");
            pending.complete(Err(DispatchError::DuplicateCorrelationKey(key)));
            return Err(DispatchError::DuplicateCorrelationKey(key));
        }
        self.entries.insert(key, pending);
        Ok(())
    }

    pub fn take(&mut self, key: &CorrelationKey) -> Option<PendingRequest> {
        self.entries.remove(key)
    }

    pub fn take_oldest(&mut self) -> Option<PendingRequest> {
        self.entries.pop_first().map(|(_, pending)| pending)
    }

    pub fn oldest_mut(&mut self) -> Option<&mut PendingRequest> {
        self.entries.values_mut().next()
    }

    pub fn take_request(&mut self, request: RequestId) -> Option<PendingRequest> {
        let key = self
            .entries
            .values()
            .find(|pending| pending.request == request)
            .map(|pending| pending.key)?;
        self.entries.remove(&key)
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = PendingRequest> {
        std::mem::take(&mut self.entries).into_values()
    }

    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
