use std::collections::HashMap;
use std::time::Duration;

use labwire_frame::config::millis;
use labwire_frame::FrameConfig;
use serde::Deserialize;

/// Default wait for a reply before a command times out.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default rounding for numeric device parameters.
pub const DEFAULT_PRECISION: usize = 3;

/// Timeout and retry budget for one class of commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandPolicy {
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
    /// Re-submissions allowed after a timeout. `0` means a single attempt.
    pub retries: u32,
}

impl CommandPolicy {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self { timeout, retries }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
            retries: 0,
        }
    }
}

/// Per-class command policies with a fallback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub default_policy: CommandPolicy,
    pub classes: HashMap<String, CommandPolicy>,
}

impl DispatchConfig {
    /// Policy for a command class, falling back to the default.
    pub fn policy_for(&self, class: Option<&str>) -> CommandPolicy {
        class
            .and_then(|class| self.classes.get(class))
            .copied()
            .unwrap_or(self.default_policy)
    }

    pub fn with_default_policy(mut self, policy: CommandPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_class(mut self, class: impl Into<String>, policy: CommandPolicy) -> Self {
        self.classes.insert(class.into(), policy);
        self
    }
}

/// A line-oriented device dialect.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LineProtocol {
    /// Sequence ending every command and reply line.
    pub terminator: String,
    /// Token marking a successful reply. Matched case-insensitively.
    pub ack: String,
    /// A reply token starting with one of these (case-insensitively) is an error.
    pub error_keywords: Vec<String>,
    /// Decimal places for float parameters.
    pub precision: usize,
    /// Symbolic command name to wire mnemonic.
    pub mnemonics: HashMap<String, String>,
    /// Commands allowed on the wire at once. Replies carry no id, so
    /// anything above 1 relies on the device answering in order.
    pub max_in_flight: usize,
    /// Discard buffered input before writing into an idle connection.
    pub flush_stale_input: bool,
}

impl Default for LineProtocol {
    fn default() -> Self {
        Self {
            terminator: "\n".to_string(),
            ack: "OK".to_string(),
            error_keywords: vec!["err".to_string(), "alarm".to_string()],
            precision: DEFAULT_PRECISION,
            mnemonics: HashMap::new(),
            max_in_flight: 1,
            flush_stale_input: true,
        }
    }
}

impl LineProtocol {
    /// Heater-shaker module firmware.
    pub fn heater_shaker() -> Self {
        let mnemonics = [
            ("HOME_PLATE", "G28"),
            ("GET_INFO", "M115"),
            ("SET_RPM", "M3"),
            ("GET_RPM", "M123"),
            ("SET_TEMP", "M104"),
            ("GET_TEMP", "M105"),
            ("SET_ACC", "M204"),
            ("SET_PID", "M301"),
            ("GET_LOCK", "M241"),
            ("OPEN_LOCK", "M242"),
            ("CLOSE_LOCK", "M243"),
            ("SET_HEATER", "M104.D"),
            ("DEBUG_INFO", "M105.D"),
            ("DEACTIVATE_HEATER", "M106"),
        ];
        Self {
            terminator: "\r\n".to_string(),
            mnemonics: mnemonics
                .into_iter()
                .map(|(name, gcode)| (name.to_string(), gcode.to_string()))
                .collect(),
            ..Self::default()
        }
    }

    /// Smoothieware motion controller.
    pub fn smoothie() -> Self {
        Self {
            terminator: "\r\n\r\n".to_string(),
            ack: "ok".to_string(),
            error_keywords: vec!["error".to_string(), "alarm".to_string()],
            ..Self::default()
        }
    }

    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }

    pub fn with_ack(mut self, ack: impl Into<String>) -> Self {
        self.ack = ack.into();
        self
    }

    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_mnemonic(mut self, name: impl Into<String>, mnemonic: impl Into<String>) -> Self {
        self.mnemonics.insert(name.into(), mnemonic.into());
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_flush_stale_input(mut self, flush: bool) -> Self {
        self.flush_stale_input = flush;
        self
    }

    /// Wire mnemonic for a command name; unknown names go out as-is.
    pub fn mnemonic<'a>(&'a self, name: &'a str) -> &'a str {
        self.mnemonics.get(name).map_or(name, String::as_str)
    }

    pub(crate) fn classify(&self, line: &str) -> LineKind {
        let mut acked = false;
        for token in line.split_whitespace() {
            let lower = token.to_ascii_lowercase();
            if self
                .error_keywords
                .iter()
                .any(|keyword| lower.starts_with(&keyword.to_ascii_lowercase()))
            {
                return LineKind::Error;
            }
            if token.eq_ignore_ascii_case(&self.ack) {
                acked = true;
            }
        }
        if acked {
            LineKind::Ack
        } else {
            LineKind::Data
        }
    }

    /// The line with every ack token removed.
    pub(crate) fn strip_ack(&self, line: &str) -> String {
        line.split_whitespace()
            .filter(|token| !token.eq_ignore_ascii_case(&self.ack))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineKind {
    Ack,
    Error,
    Data,
}

/// Wire protocol spoken on a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Protocol {
    /// JSON-RPC 2.0 objects, correlated by id.
    #[default]
    JsonRpc,
    /// Terminated text lines, correlated by send order.
    Line(LineProtocol),
}

impl Protocol {
    pub fn is_line(&self) -> bool {
        matches!(self, Protocol::Line(_))
    }

    pub fn line(&self) -> Option<&LineProtocol> {
        match self {
            Protocol::Line(protocol) => Some(protocol),
            Protocol::JsonRpc => None,
        }
    }
}

/// Everything a client connection needs besides its transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    pub protocol: Protocol,
    pub dispatch: DispatchConfig,
    pub frame: FrameConfig,
}

impl ConnectionConfig {
    pub fn json_rpc() -> Self {
        Self::default()
    }

    pub fn line(protocol: LineProtocol) -> Self {
        Self {
            protocol: Protocol::Line(protocol),
            ..Self::default()
        }
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_frame(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }
}

/// JSON-RPC server limits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Further connections are closed right after accept.
    pub max_connections: usize,
    /// Permission bits for the socket file.
    pub socket_mode: u32,
    pub frame: FrameConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            socket_mode: 0o600,
            frame: FrameConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_socket_mode(mut self, mode: u32) -> Self {
        self.socket_mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_falls_back_to_default() {
        let dispatch = DispatchConfig::default()
            .with_default_policy(CommandPolicy::new(Duration::from_secs(1), 0))
            .with_class("motion", CommandPolicy::new(Duration::from_secs(60), 2));

        assert_eq!(dispatch.policy_for(Some("motion")).retries, 2);
        assert_eq!(dispatch.policy_for(Some("unknown")).timeout, Duration::from_secs(1));
        assert_eq!(dispatch.policy_for(None).retries, 0);
    }

    #[test]
    fn retries_default_to_zero() {
        assert_eq!(CommandPolicy::default().retries, 0);
    }

    #[test]
    fn dispatch_config_from_json() {
        let dispatch: DispatchConfig = serde_json::from_str(
            r#"{
                "default_policy": {"timeout_ms": 5000},
                "classes": {"home": {"timeout_ms": 120000, "retries": 1}}
            }"#,
        )
        .expect("dispatch config should parse");
        assert_eq!(dispatch.default_policy.timeout, Duration::from_secs(5));
        assert_eq!(dispatch.policy_for(Some("home")).timeout, Duration::from_secs(120));
        assert_eq!(dispatch.policy_for(Some("home")).retries, 1);
    }

    #[test]
    fn protocol_is_tagged_by_mode() {
        let protocol: Protocol =
            serde_json::from_str(r#"{"mode": "line", "terminator": "\r\n", "ack": "ok"}"#)
                .expect("protocol should parse");
        let line = protocol.line().expect("line protocol");
        assert_eq!(line.terminator, "\r\n");
        assert_eq!(line.ack, "ok");
        assert_eq!(line.max_in_flight, 1);

        let protocol: Protocol =
            serde_json::from_str(r#"{"mode": "json_rpc"}"#).expect("protocol should parse");
        assert_eq!(protocol, Protocol::JsonRpc);
    }

    #[test]
    fn heater_shaker_mnemonics() {
        let protocol = LineProtocol::heater_shaker();
        assert_eq!(protocol.mnemonic("SET_RPM"), "M3");
        assert_eq!(protocol.mnemonic("DEBUG_INFO"), "M105.D");
        assert_eq!(protocol.mnemonic("M999"), "M999");
        assert_eq!(protocol.terminator, "\r\n");
    }

    #[test]
    fn classify_lines() {
        let protocol = LineProtocol::default();
        assert_eq!(protocol.classify("OK"), LineKind::Ack);
        assert_eq!(protocol.classify("M105 T:37.0 C:37.0 ok"), LineKind::Ack);
        assert_eq!(protocol.classify("err out of range"), LineKind::Error);
        assert_eq!(protocol.classify("ERR003:motor stalled"), LineKind::Error);
        assert_eq!(protocol.classify("ALARM: hard limit"), LineKind::Error);
        assert_eq!(protocol.classify("T:37.0"), LineKind::Data);
        assert_eq!(protocol.classify("OKAY"), LineKind::Data);
    }

    #[test]
    fn smoothie_error_keywords() {
        let protocol = LineProtocol::smoothie();
        assert_eq!(protocol.classify("ok"), LineKind::Ack);
        assert_eq!(protocol.classify("error:Unsupported command"), LineKind::Error);
        assert_eq!(protocol.classify("err"), LineKind::Data);
    }

    #[test]
    fn strip_ack_keeps_payload() {
        let protocol = LineProtocol::default();
        assert_eq!(protocol.strip_ack("M123 C:1337 T:1337 OK"), "M123 C:1337 T:1337");
        assert_eq!(protocol.strip_ack("ok"), "");
    }
}
