use serde::Deserialize;

/// Controls how the registry treats tags it has no entry for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarshalConfig {
    /// When true, unknown tags return `MarshalError::NoEntry` instead
    /// of passing the value through.
    pub fail_on_missing_entry: bool,
}
