//! Method table for the JSON-RPC server.
//!
//! Handlers work with rich types. Each registered method carries a
//! [`MethodSpec`] naming the marshal tag of every parameter and of the
//! return value, and the registry converts between wire JSON and those
//! types around every call.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use labwire_marshal::{MarshalRegistry, TypeTag};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::command::same_wire_value;
use crate::error::{PeerError, Result};
use crate::jsonrpc::{
    RpcErrorObject, DISPATCH_EXCEPTION, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR,
};

/// One declared method parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    /// Marshal tag used to deserialize the argument. `None` keeps the raw
    /// JSON value.
    pub tag: Option<TypeTag>,
    /// An incoming value equal to this is dropped before marshalling so
    /// the handler applies its own default.
    pub default: Option<Value>,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: None,
            default: None,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            tag: None,
            default: Some(default.into()),
            required: false,
        }
    }

    pub fn tagged(mut self, tag: impl Into<TypeTag>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// Signature of a served method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSpec {
    pub name: String,
    /// In positional order.
    pub params: Vec<ParamSpec>,
    /// Marshal tag for the return value. Without one the handler must
    /// return a [`Value`] or `()`.
    pub returns: Option<TypeTag>,
}

impl MethodSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: None,
        }
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn returns(mut self, tag: impl Into<TypeTag>) -> Self {
        self.returns = Some(tag.into());
        self
    }

    fn param_spec(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|param| param.name == name)
    }
}

/// JSON-RPC error produced by a method or by dispatch itself.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct MethodError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl MethodError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn parse_error(detail: impl fmt::Display) -> Self {
        Self::new(PARSE_ERROR, "parse error").with_data(detail.to_string())
    }

    pub fn invalid_request(detail: impl fmt::Display) -> Self {
        Self::new(INVALID_REQUEST, "invalid request").with_data(detail.to_string())
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, "method not found").with_data(method)
    }

    pub fn invalid_params(detail: impl fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, "invalid params").with_data(detail.to_string())
    }

    pub fn internal(detail: impl fmt::Display) -> Self {
        Self::new(INTERNAL_ERROR, "internal error").with_data(detail.to_string())
    }

    /// A handler panicked; `detail` is the panic message.
    pub fn dispatch_exception(detail: impl Into<String>) -> Self {
        Self::new(DISPATCH_EXCEPTION, "uncaught exception in dispatch").with_data(detail.into())
    }
}

impl From<MethodError> for RpcErrorObject {
    fn from(err: MethodError) -> Self {
        RpcErrorObject {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Unmarshalled arguments of one call.
///
/// Tagged parameters hold the type their marshal entry produces; untagged
/// ones hold a [`Value`]. Parameters dropped for equalling their default
/// are absent.
#[derive(Default)]
pub struct Params {
    values: HashMap<String, Box<dyn Any + Send>>,
}

impl Params {
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get<T: Any + Clone>(&self, name: &str) -> std::result::Result<T, MethodError> {
        self.get_opt(name)?
            .ok_or_else(|| MethodError::invalid_params(format!("missing parameter {name:?}")))
    }

    pub fn get_opt<T: Any + Clone>(&self, name: &str) -> std::result::Result<Option<T>, MethodError> {
        let Some(value) = self.values.get(name) else {
            return Ok(None);
        };
        value.downcast_ref::<T>().cloned().map(Some).ok_or_else(|| {
            MethodError::invalid_params(format!(
                "parameter {name:?} is not a {}",
                type_name::<T>()
            ))
        })
    }

    /// Deserialize an untagged parameter with serde.
    pub fn parse<T: DeserializeOwned>(&self, name: &str) -> std::result::Result<Option<T>, MethodError> {
        let Some(value) = self.values.get(name) else {
            return Ok(None);
        };
        let raw = value.downcast_ref::<Value>().ok_or_else(|| {
            MethodError::invalid_params(format!("parameter {name:?} is tagged, use get"))
        })?;
        serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|err| MethodError::invalid_params(format!("parameter {name:?}: {err}")))
    }

    fn insert(&mut self, name: String, value: Box<dyn Any + Send>) {
        self.values.insert(name, value);
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.values.keys().collect();
        names.sort_unstable();
        f.debug_struct("Params").field("names", &names).finish()
    }
}

type HandlerOutput = std::result::Result<Box<dyn Any + Send>, MethodError>;
type HandlerFuture = Pin<Box<dyn Future<Output = HandlerOutput> + Send>>;
type Handler = Arc<dyn Fn(Params) -> HandlerFuture + Send + Sync>;

struct Method {
    spec: Arc<MethodSpec>,
    handler: Handler,
}

/// Name-to-handler table served by a `JsonRpcServer`.
#[derive(Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Method>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `spec.name`.
    pub fn register<F, Fut, R>(&mut self, spec: MethodSpec, handler: F) -> Result<()>
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, MethodError>> + Send + 'static,
        R: Any + Send,
    {
        if self.methods.contains_key(&spec.name) {
            return Err(PeerError::DuplicateMethod(spec.name));
        }

        let erased: Handler = Arc::new(move |params: Params| -> HandlerFuture {
            let call = handler(params);
            Box::pin(async move { call.await.map(|ret| Box::new(ret) as Box<dyn Any + Send>) })
        });
        trace!(method = %spec.name, params = spec.params.len(), "registered method");
        self.methods.insert(
            spec.name.clone(),
            Method {
                spec: Arc::new(spec),
                handler: erased,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn spec(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.get(name).map(|method| method.spec.as_ref())
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Unmarshal `params` for `method` and start the handler.
    ///
    /// `params` may be named (an object) or positional (an array matched
    /// against the declared order).
    pub fn prepare(
        &self,
        method: &str,
        params: Option<Value>,
        registry: &MarshalRegistry,
    ) -> std::result::Result<PreparedCall, MethodError> {
        let entry = self
            .methods
            .get(method)
            .ok_or_else(|| MethodError::method_not_found(method))?;
        let spec = &entry.spec;

        let named = match params {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(Value::Array(values)) => {
                if values.len() > spec.params.len() {
                    return Err(MethodError::invalid_params(format!(
                        "{method} takes at most {} positional parameters, got {}",
                        spec.params.len(),
                        values.len()
                    )));
                }
                spec.params
                    .iter()
                    .zip(values)
                    .map(|(param, value)| (param.name.clone(), value))
                    .collect()
            }
            Some(other) => {
                return Err(MethodError::invalid_params(format!(
                    "params must be an object or an array, got {other}"
                )))
            }
        };

        let mut unmarshalled = Params::default();
        for param in spec.params.iter().filter(|param| param.required) {
            if !named.contains_key(&param.name) {
                return Err(MethodError::invalid_params(format!(
                    "missing required parameter {:?}",
                    param.name
                )));
            }
        }
        for (name, value) in named {
            let param = spec
                .param_spec(&name)
                .ok_or_else(|| MethodError::invalid_params(format!("unexpected parameter {name:?}")))?;
            if param
                .default
                .as_ref()
                .is_some_and(|default| same_wire_value(default, &value))
            {
                trace!(method, param = %name, "dropping default-valued parameter");
                continue;
            }
            let value: Box<dyn Any + Send> = match &param.tag {
                Some(tag) => registry
                    .deserialize(tag.as_str(), &value)
                    .map_err(|err| MethodError::invalid_params(format!("parameter {name:?}: {err}")))?,
                None => Box::new(value),
            };
            unmarshalled.insert(name, value);
        }

        debug!(method, params = unmarshalled.len(), "dispatching");
        Ok(PreparedCall {
            spec: Arc::clone(spec),
            future: (entry.handler)(unmarshalled),
        })
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

/// A started handler awaiting completion.
pub struct PreparedCall {
    spec: Arc<MethodSpec>,
    future: HandlerFuture,
}

impl PreparedCall {
    pub fn method(&self) -> &str {
        &self.spec.name
    }

    /// Wait for the handler and marshal its return value.
    pub async fn run(self, registry: &MarshalRegistry) -> std::result::Result<Value, MethodError> {
        let returned = self.future.await?;
        match &self.spec.returns {
            Some(tag) => registry
                .serialize(tag.as_str(), returned.as_ref())
                .map_err(MethodError::internal),
            None => {
                if returned.is::<()>() {
                    return Ok(Value::Null);
                }
                returned.downcast::<Value>().map(|value| *value).map_err(|_| {
                    MethodError::internal(format!(
                        "{} returned a rich value but declares no return tag",
                        self.spec.name
                    ))
                })
            }
        }
    }
}

impl fmt::Debug for PreparedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedCall")
            .field("method", &self.spec.name)
            .finish_non_exhaustive()
    }
}
