//! JSON-RPC 2.0 envelopes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Reserved server error for a handler that panicked.
pub const DISPATCH_EXCEPTION: i64 = -32063;

/// A request or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(Value::from(id)),
            method: method.into(),
            params: Some(Value::Object(params)),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn to_bytes(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcOutcome {
    Result(Value),
    Error(RpcErrorObject),
}

/// A response as written by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(flatten)]
    pub outcome: RpcOutcome,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            outcome: RpcOutcome::Result(result),
        }
    }

    pub fn failure(id: Value, error: RpcErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            outcome: RpcOutcome::Error(error),
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// A response as read by the client.
///
/// `outcome` is an `Err` when the object carries neither `result` nor a
/// well-formed `error`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseParts {
    pub id: Value,
    pub outcome: Result<RpcOutcome, String>,
}

/// What an inbound JSON object turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request(RpcRequest),
    Response(ResponseParts),
    Invalid(String),
}

/// Sort an inbound object into request, response or garbage.
///
/// Presence of a member is checked on the raw map so that `"result": null`
/// still counts as a result.
pub fn classify(value: Value) -> Inbound {
    let Value::Object(mut map) = value else {
        return Inbound::Invalid("message is not a JSON object".to_string());
    };

    if map.contains_key("method") {
        return match serde_json::from_value::<RpcRequest>(Value::Object(map)) {
            Ok(request) if request.jsonrpc == JSONRPC_VERSION => Inbound::Request(request),
            Ok(request) => Inbound::Invalid(format!(
                "unsupported jsonrpc version {:?}",
                request.jsonrpc
            )),
            Err(err) => Inbound::Invalid(format!("malformed request: {err}")),
        };
    }

    if !(map.contains_key("id") || map.contains_key("result") || map.contains_key("error")) {
        return Inbound::Invalid("object is neither a request nor a response".to_string());
    }

    let id = map.remove("id").unwrap_or(Value::Null);
    let outcome = if let Some(result) = map.remove("result") {
        Ok(RpcOutcome::Result(result))
    } else if let Some(error) = map.remove("error") {
        serde_json::from_value::<RpcErrorObject>(error)
            .map(RpcOutcome::Error)
            .map_err(|err| format!("malformed error object: {err}"))
    } else {
        Err("response carries neither result nor error".to_string())
    };
    Inbound::Response(ResponseParts { id, outcome })
}
