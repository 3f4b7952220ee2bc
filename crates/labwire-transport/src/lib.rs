//! Async transport handles for labwire.
//!
//! Provides one owned stream type over the two transports the protocol core
//! runs on:
//! - Unix domain sockets (the JSON-RPC control plane)
//! - Serial device nodes (line-oriented device drivers)
//!
//! This is the lowest layer of labwire. Everything else builds on top of
//! the [`DeviceStream`] type provided here.

pub mod device;
pub mod error;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use device::open_device;
pub use error::{Result, TransportError};
pub use traits::{DeviceStream, StreamKind};

#[cfg(unix)]
pub use uds::UnixDomainSocket;
