//! Command correlation and connection lifecycle for labwire.
//!
//! This is the layer callers talk to. Open a [`Connection`] over a socket or
//! a device node, submit [`Command`]s, and await their replies. Replies are
//! matched to requests by id for JSON-RPC peers and by send order for
//! line-protocol devices. [`JsonRpcServer`] is the other side: it serves a
//! [`MethodRegistry`] over a Unix socket.

pub mod command;
pub mod config;
pub mod connection;
pub mod connector;
pub mod correlation;
pub mod error;
pub mod jsonrpc;
pub mod methods;
pub mod server;

pub use command::{ArgValue, Argument, Command, CommandEncoder};
pub use config::{
    CommandPolicy, ConnectionConfig, DispatchConfig, LineProtocol, Protocol, ServerConfig,
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_PRECISION,
};
pub use connection::{
    close_connection, open_connection, submit_command, Connection, ConnectionId, ConnectionState,
    Reply, ReplyHandle,
};
pub use connector::{connect, open_device};
pub use correlation::{CorrelationKey, CorrelationTable, PendingRequest, RequestId};
pub use error::{DispatchError, ErrorKind, PeerError, RemoteError, Result};
pub use jsonrpc::{RpcErrorObject, RpcOutcome, RpcRequest, RpcResponse};
pub use methods::{MethodError, MethodRegistry, MethodSpec, ParamSpec, Params, PreparedCall};
pub use server::{JsonRpcServer, ServerConnection, ServerHandle};
