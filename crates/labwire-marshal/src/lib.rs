//! Tag-keyed JSON marshalling for values that cross the JSON-RPC boundary.
//!
//! Method handlers work with rich types (`Mount`, `Point`, maps keyed by
//! `Axis`); the wire only carries JSON. A [`MarshalRegistry`] maps a
//! [`TypeTag`] to a serializer/deserializer pair so the dispatcher can
//! convert arguments and return values by their declared tag.
//!
//! Tags without an entry pass through untouched unless the registry is
//! configured to reject them.

pub mod config;
pub mod error;
pub mod lab;
pub mod registry;
pub mod tag;

pub use config::MarshalConfig;
pub use error::{MarshalError, Result};
pub use registry::MarshalRegistry;
pub use tag::TypeTag;
