//! Async command/response framing and dispatch for lab automation devices.
//!
//! labwire turns a raw byte stream (a Unix socket speaking JSON-RPC 2.0, or
//! a serial node speaking a gcode-style ack protocol) into typed commands
//! and replies.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix sockets and device nodes as one stream type
//! - [`frame`]: Byte buffering plus JSON-object and line framing
//! - [`marshal`]: Tag-keyed conversion of domain types to and from JSON
//! - [`peer`]: Connections, correlation, dispatch and the JSON-RPC server
//! - [`logging`]: `tracing` subscriber setup for binaries and demos
//! - [`settings`]: JSON settings files

pub mod logging;
pub mod settings;

pub use settings::Settings;

/// Re-export transport types.
pub mod transport {
    pub use labwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use labwire_frame::*;
}

/// Re-export marshalling types.
pub mod marshal {
    pub use labwire_marshal::*;
}

/// Re-export connection and server types.
pub mod peer {
    pub use labwire_peer::*;
}
