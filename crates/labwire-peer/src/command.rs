use std::any::Any;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use bytes::Bytes;
use labwire_marshal::{MarshalRegistry, TypeTag};
use serde_json::{Map, Value};
use tracing::trace;

use crate::config::{CommandPolicy, LineProtocol, Protocol};
use crate::correlation::CorrelationKey;
use crate::error::{PeerError, Result};
use crate::jsonrpc::RpcRequest;

/// An argument value before marshalling.
pub enum ArgValue {
    /// Already a wire value.
    Wire(Value),
    /// A rich value converted through the marshal entry for `tag`.
    Typed {
        tag: TypeTag,
        value: Box<dyn Any + Send>,
    },
}

impl fmt::Debug for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Wire(value) => f.debug_tuple("Wire").field(value).finish(),
            ArgValue::Typed { tag, .. } => f.debug_struct("Typed").field("tag", tag).finish_non_exhaustive(),
        }
    }
}

/// One named command argument.
///
/// On a line protocol `name` is the parameter prefix (`S` in `M3 S1337`).
#[derive(Debug)]
pub struct Argument {
    pub name: String,
    pub value: ArgValue,
    /// Omitted from the wire when the marshalled value equals this.
    pub default: Option<Value>,
    /// Decimal places for a float value, overriding the protocol's.
    pub precision: Option<usize>,
}

impl Argument {
    pub fn wire(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: ArgValue::Wire(value.into()),
            default: None,
            precision: None,
        }
    }

    pub fn typed<T: Any + Send>(name: impl Into<String>, tag: impl Into<TypeTag>, value: T) -> Self {
        Self {
            name: name.into(),
            value: ArgValue::Typed {
                tag: tag.into(),
                value: Box::new(value),
            },
            default: None,
            precision: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_precision(mut self, places: usize) -> Self {
        self.precision = Some(places);
        self
    }
}

/// A domain-level command: a name plus ordered arguments.
#[derive(Debug)]
pub struct Command {
    pub name: String,
    pub args: Vec<Argument>,
    /// Selects a [`CommandPolicy`] from the dispatch config.
    pub class: Option<String>,
    /// Overrides the class policy.
    pub policy: Option<CommandPolicy>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            class: None,
            policy: None,
        }
    }

    pub fn with_args(name: impl Into<String>, args: impl IntoIterator<Item = Argument>) -> Self {
        Self {
            args: args.into_iter().collect(),
            ..Self::new(name)
        }
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.push(Argument::wire(name, value));
        self
    }

    pub fn typed_arg<T: Any + Send>(
        mut self,
        name: impl Into<String>,
        tag: impl Into<TypeTag>,
        value: T,
    ) -> Self {
        self.args.push(Argument::typed(name, tag, value));
        self
    }

    /// Declare the default of the most recently added argument.
    pub fn default(mut self, default: impl Into<Value>) -> Self {
        if let Some(arg) = self.args.last_mut() {
            arg.default = Some(default.into());
        }
        self
    }

    /// Set the precision of the most recently added argument.
    pub fn precision(mut self, places: usize) -> Self {
        if let Some(arg) = self.args.last_mut() {
            arg.precision = Some(places);
        }
        self
    }

    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn policy(mut self, policy: CommandPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// Turns [`Command`]s into wire bytes for one protocol.
#[derive(Debug, Clone)]
pub struct CommandEncoder {
    registry: Arc<MarshalRegistry>,
    protocol: Protocol,
}

impl CommandEncoder {
    pub fn new(registry: Arc<MarshalRegistry>, protocol: Protocol) -> Self {
        Self { registry, protocol }
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn registry(&self) -> &Arc<MarshalRegistry> {
        &self.registry
    }

    /// Encode for this encoder's protocol. Line protocols ignore the key.
    pub fn encode(&self, command: &Command, key: CorrelationKey) -> Result<Bytes> {
        match self.protocol {
            Protocol::JsonRpc => self.encode_jsonrpc(command, key.value()),
            Protocol::Line(_) => self.encode_line(command),
        }
    }

    /// `{"jsonrpc":"2.0","id":id,"method":name,"params":{..}}`, unterminated.
    pub fn encode_jsonrpc(&self, command: &Command, id: u64) -> Result<Bytes> {
        let params: Map<String, Value> = self
            .wire_args(command)?
            .into_iter()
            .map(|(arg, value)| (arg.name.clone(), value))
            .collect();
        let bytes = RpcRequest::new(id, command.name.as_str(), params).to_bytes()?;
        trace!(method = %command.name, id, "encoded json-rpc request");
        Ok(bytes)
    }

    /// `MNEMONIC P1 P2 ...` followed by the protocol terminator.
    pub fn encode_line(&self, command: &Command) -> Result<Bytes> {
        let protocol = self.line_protocol()?;
        let mut line = protocol.mnemonic(&command.name).to_string();
        for (arg, value) in self.wire_args(command)? {
            line.push(' ');
            line.push_str(&arg.name);
            render_parameter(
                &mut line,
                &arg.name,
                &value,
                arg.precision.unwrap_or(protocol.precision),
            )?;
        }
        trace!(line = %line, "encoded line command");
        line.push_str(&protocol.terminator);
        Ok(Bytes::from(line))
    }

    fn line_protocol(&self) -> Result<&LineProtocol> {
        self.protocol
            .line()
            .ok_or_else(|| PeerError::Encode("line encoding needs a line protocol".to_string()))
    }

    /// Marshalled arguments in declaration order, defaults dropped.
    fn wire_args<'c>(&self, command: &'c Command) -> Result<Vec<(&'c Argument, Value)>> {
        let mut out = Vec::with_capacity(command.args.len());
        for arg in &command.args {
            let value = match &arg.value {
                ArgValue::Wire(value) => value.clone(),
                ArgValue::Typed { tag, value } => self.registry.serialize(tag.as_str(), &**value)?,
            };
            if self.is_default(arg, &value) {
                trace!(command = %command.name, arg = %arg.name, "omitting default-valued argument");
                continue;
            }
            out.push((arg, value));
        }
        Ok(out)
    }

    /// Line protocols compare what would actually be written, so a value
    /// that rounds to its default is omitted too.
    fn is_default(&self, arg: &Argument, value: &Value) -> bool {
        let Some(default) = &arg.default else {
            return false;
        };
        if same_wire_value(default, value) {
            return true;
        }
        let Some(protocol) = self.protocol.line() else {
            return false;
        };
        let precision = arg.precision.unwrap_or(protocol.precision);
        let (mut sent, mut expected) = (String::new(), String::new());
        render_parameter(&mut sent, &arg.name, value, precision).is_ok()
            && render_parameter(&mut expected, &arg.name, default, precision).is_ok()
            && sent == expected
    }
}

/// Wire equality, treating `1` and `1.0` as the same number.
pub(crate) fn same_wire_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn render_parameter(out: &mut String, name: &str, value: &Value, precision: usize) -> Result<()> {
    match value {
        Value::Null => {}
        Value::Bool(flag) => out.push(if *flag { '1' } else { '0' }),
        Value::Number(number) if number.is_f64() => {
            let float = number.as_f64().unwrap_or_default();
            let start = out.len();
            let _ = write!(out, "{float:.precision$}");
            // "-0.000" after rounding is still zero.
            if out[start..].starts_with('-') && out[start + 1..].bytes().all(|b| b == b'0' || b == b'.') {
                out.remove(start);
            }
        }
        Value::Number(number) => {
            let _ = write!(out, "{number}");
        }
        Value::String(text) => out.push_str(text),
        Value::Array(_) | Value::Object(_) => {
            return Err(PeerError::Encode(format!(
                "argument {name} is a {} and cannot go on a command line",
                if value.is_array() { "list" } else { "map" }
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use labwire_marshal::lab::{self, Mount, Point};
    use serde_json::json;

    use super::*;

    fn encoder(protocol: Protocol) -> CommandEncoder {
        let registry = lab::standard_registry().expect("lab types should register");
        CommandEncoder::new(Arc::new(registry), protocol)
    }

    fn line(encoder: &CommandEncoder, command: &Command) -> String {
        let bytes = encoder.encode_line(command).expect("command should encode");
        String::from_utf8(bytes.to_vec()).expect("line should be utf-8")
    }

    fn params(encoder: &CommandEncoder, command: &Command) -> Value {
        let bytes = encoder.encode_jsonrpc(command, 1).expect("command should encode");
        let request: Value = serde_json::from_slice(&bytes).expect("request should be json");
        request["params"].clone()
    }

    #[test]
    fn jsonrpc_envelope() {
        let encoder = encoder(Protocol::JsonRpc);
        let bytes = encoder.encode_jsonrpc(&Command::new("ping"), 1).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping", "params": {}})
        );
    }

    #[test]
    fn jsonrpc_marshals_typed_arguments() {
        let encoder = encoder(Protocol::JsonRpc);
        let command = Command::new("move_to")
            .typed_arg("mount", lab::MOUNT, Mount::Right)
            .typed_arg("abs_position", lab::POINT, Point::new(10.0, 20.0, 30.5))
            .arg("speed", 50);

        assert_eq!(
            params(&encoder, &command),
            json!({"mount": "RIGHT", "abs_position": [10.0, 20.0, 30.5], "speed": 50})
        );
    }

    #[test]
    fn default_valued_argument_is_omitted() {
        let encoder = encoder(Protocol::JsonRpc);
        let at_default = Command::new("home").arg("axes", Value::Null).default(Value::Null);
        assert_eq!(params(&encoder, &at_default), json!({}));

        let overridden = Command::new("home").arg("axes", json!(["X"])).default(Value::Null);
        assert_eq!(params(&encoder, &overridden), json!({"axes": ["X"]}));
    }

    #[test]
    fn default_comparison_ignores_number_representation() {
        let encoder = encoder(Protocol::Line(LineProtocol::default()));
        let command = Command::new("M204").arg("S", 0).default(0.0);
        assert_eq!(line(&encoder, &command), "M204\n");
    }

    #[test]
    fn default_comparison_uses_rendered_precision() {
        let encoder = encoder(Protocol::Line(LineProtocol::heater_shaker()));
        let rounds_to_default = Command::new("SET_TEMP").arg("S", 37.0001).default(37.0).precision(1);
        assert_eq!(line(&encoder, &rounds_to_default), "M104\r\n");

        let distinct = Command::new("SET_TEMP").arg("S", 37.06).default(37.0).precision(1);
        assert_eq!(line(&encoder, &distinct), "M104 S37.1\r\n");

        // JSON-RPC carries full precision, so nothing is rounded away there.
        let json = self::encoder(Protocol::JsonRpc);
        assert_eq!(params(&json, &rounds_to_default), json!({"S": 37.0001}));
    }

    #[test]
    fn line_uses_mnemonic_and_prefixes() {
        let encoder = encoder(Protocol::Line(
            LineProtocol::default().with_mnemonic("SET_RPM", "M3"),
        ));
        assert_eq!(line(&encoder, &Command::new("SET_RPM").arg("S", 1337)), "M3 S1337\n");
        assert_eq!(line(&encoder, &Command::new("M115")), "M115\n");
    }

    #[test]
    fn line_floats_use_fixed_precision() {
        let encoder = encoder(Protocol::Line(LineProtocol::default()));
        let command = Command::new("G0").arg("X", 10.0).arg("Y", 2.34567).arg("Z", -0.0001);
        assert_eq!(line(&encoder, &command), "G0 X10.000 Y2.346 Z0.000\n");
    }

    #[test]
    fn per_argument_precision_overrides_protocol() {
        let encoder = encoder(Protocol::Line(LineProtocol::heater_shaker()));
        let command = Command::new("SET_TEMP").arg("S", 37.26).precision(1);
        assert_eq!(line(&encoder, &command), "M104 S37.3\r\n");
    }

    #[test]
    fn line_renders_null_bool_and_string() {
        let encoder = encoder(Protocol::Line(LineProtocol::default()));
        let command = Command::new("M92")
            .arg("X", Value::Null)
            .arg("E", true)
            .arg("F", false)
            .arg("P", "abc");
        assert_eq!(line(&encoder, &command), "M92 X E1 F0 Pabc\n");
    }

    #[test]
    fn line_rejects_structured_values() {
        let encoder = encoder(Protocol::Line(LineProtocol::default()));
        let result = encoder.encode_line(&Command::new("G0").arg("X", json!([1, 2])));
        assert!(matches!(result, Err(PeerError::Encode(_))));
    }

    #[test]
    fn line_encoding_needs_line_protocol() {
        let encoder = encoder(Protocol::JsonRpc);
        assert!(matches!(
            encoder.encode_line(&Command::new("M115")),
            Err(PeerError::Encode(_))
        ));
    }

    #[test]
    fn typed_argument_with_wrong_rust_type_fails() {
        let encoder = encoder(Protocol::JsonRpc);
        let command = Command::new("home").typed_arg("mount", lab::MOUNT, "left".to_string());
        assert!(matches!(
            encoder.encode_jsonrpc(&command, 1),
            Err(PeerError::Marshal(_))
        ));
    }
}
