use crate::tag::TypeTag;

/// Errors raised while registering or applying marshalling entries.
#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    /// A second entry was registered under an existing tag.
    #[error("marshal entry already registered for {0}")]
    DuplicateEntry(TypeTag),

    /// No entry exists and the registry refuses to pass values through.
    #[error("no marshal entry registered for {0}")]
    NoEntry(TypeTag),

    /// The value handed in is not the Rust type the entry was built for.
    #[error("type mismatch for {tag}: expected {expected}")]
    TypeMismatch { tag: TypeTag, expected: &'static str },

    /// The JSON value does not have the shape the entry expects.
    #[error("invalid value for {tag}: {message}")]
    InvalidWireValue { tag: TypeTag, message: String },

    /// A name did not match any variant of a lab enum.
    #[error("unknown {kind} name: {name:?}")]
    UnknownVariant { kind: &'static str, name: String },

    /// serde_json failed on an intermediate conversion.
    #[error("JSON conversion failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MarshalError>;
