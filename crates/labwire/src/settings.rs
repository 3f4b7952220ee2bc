//! JSON settings files.
//!
//! ```json
//! {
//!   "logging": { "format": "json", "level": "debug" },
//!   "dispatch": {
//!     "default_policy": { "timeout_ms": 2000, "retries": 0 },
//!     "classes": { "homing": { "timeout_ms": 30000, "retries": 1 } }
//!   },
//!   "line": { "terminator": "\r\n", "ack": "ok" },
//!   "frame": { "read_timeout_ms": 5000 },
//!   "server": { "max_connections": 8 }
//! }
//! ```
//!
//! Every section is optional; missing sections take their defaults.

use std::path::Path;

use labwire_frame::FrameConfig;
use labwire_marshal::{lab, MarshalConfig, MarshalRegistry};
use labwire_peer::{ConnectionConfig, DispatchConfig, LineProtocol, PeerError, Result, ServerConfig};
use serde::Deserialize;
use tracing::debug;

use crate::logging::{LogFormat, LogLevel};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub format: LogFormat,
    pub level: LogLevel,
}

impl LoggingSettings {
    pub fn init(&self) {
        crate::logging::init_logging(self.format, self.level);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub dispatch: DispatchConfig,
    pub server: ServerConfig,
    /// Dialect used by [`Settings::device_config`].
    pub line: LineProtocol,
    pub frame: FrameConfig,
    pub marshal: MarshalConfig,
}

impl Settings {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|err| PeerError::Settings(err.to_string()))
    }

    /// Read and parse `path`. Errors name the file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| PeerError::Settings(format!("{}: {err}", path.display())))?;
        let settings: Self = serde_json::from_str(&text)
            .map_err(|err| PeerError::Settings(format!("{}: {err}", path.display())))?;
        debug!(?path, "loaded settings");
        Ok(settings)
    }

    /// Connection settings for a JSON-RPC client.
    pub fn rpc_config(&self) -> ConnectionConfig {
        ConnectionConfig::json_rpc()
            .with_dispatch(self.dispatch.clone())
            .with_frame(self.frame.clone())
    }

    /// Connection settings for a line-protocol device using `line`.
    pub fn device_config(&self) -> ConnectionConfig {
        ConnectionConfig::line(self.line.clone())
            .with_dispatch(self.dispatch.clone())
            .with_frame(self.frame.clone())
    }

    /// A registry holding the standard lab types, honouring `marshal`.
    pub fn marshal_registry(&self) -> Result<MarshalRegistry> {
        let mut registry = MarshalRegistry::with_config(self.marshal);
        lab::register_lab_types(&mut registry)?;
        Ok(registry)
    }
}
