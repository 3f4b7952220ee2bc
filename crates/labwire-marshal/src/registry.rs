use std::any::{type_name, Any};
use std::collections::HashMap;

use serde_json::Value;
use tracing::trace;

use crate::config::MarshalConfig;
use crate::error::{MarshalError, Result};
use crate::tag::TypeTag;

type SerializeFn = Box<dyn Fn(&dyn Any) -> Result<Value> + Send + Sync>;
type DeserializeFn = Box<dyn Fn(&Value) -> Result<Box<dyn Any + Send>> + Send + Sync>;

struct SerDes {
    type_name: &'static str,
    serialize: SerializeFn,
    deserialize: DeserializeFn,
}

/// Tag-keyed table of serializer/deserializer pairs.
///
/// Populate it during startup, then share it behind an `Arc`; lookups only
/// need `&self`.
pub struct MarshalRegistry {
    entries: HashMap<TypeTag, SerDes>,
    config: MarshalConfig,
}

impl MarshalRegistry {
    /// Create an empty registry with default config.
    pub fn new() -> Self {
        Self::with_config(MarshalConfig::default())
    }

    /// Create an empty registry with explicit config.
    pub fn with_config(config: MarshalConfig) -> Self {
        Self {
            entries: HashMap::new(),
            config,
        }
    }

    /// Register the conversion pair for `T` under `tag`.
    pub fn register<T, S, D>(&mut self, tag: impl Into<TypeTag>, serialize: S, deserialize: D) -> Result<()>
    where
        T: Any + Send,
        S: Fn(&T) -> Result<Value> + Send + Sync + 'static,
        D: Fn(&Value) -> Result<T> + Send + Sync + 'static,
    {
        let tag = tag.into();
        if self.entries.contains_key(&tag) {
            return Err(MarshalError::DuplicateEntry(tag));
        }

        let mismatch_tag = tag.clone();
        let entry = SerDes {
            type_name: type_name::<T>(),
            serialize: Box::new(move |value: &dyn Any| {
                let typed = value
                    .downcast_ref::<T>()
                    .ok_or_else(|| MarshalError::TypeMismatch {
                        tag: mismatch_tag.clone(),
                        expected: type_name::<T>(),
                    })?;
                serialize(typed)
            }),
            deserialize: Box::new(move |value: &Value| {
                deserialize(value).map(|typed| Box::new(typed) as Box<dyn Any + Send>)
            }),
        };

        trace!(%tag, rust_type = entry.type_name, "registered marshal entry");
        self.entries.insert(tag, entry);
        Ok(())
    }

    /// Convert a rich value to JSON using the entry for `tag`.
    ///
    /// Without an entry the value must already be a [`Value`] and is returned
    /// unchanged.
    pub fn serialize(&self, tag: &str, value: &dyn Any) -> Result<Value> {
        match self.entries.get(tag) {
            Some(entry) => (entry.serialize)(value),
            None if self.config.fail_on_missing_entry => {
                Err(MarshalError::NoEntry(TypeTag::from(tag.to_string())))
            }
            None => value
                .downcast_ref::<Value>()
                .cloned()
                .ok_or_else(|| MarshalError::TypeMismatch {
                    tag: TypeTag::from(tag.to_string()),
                    expected: type_name::<Value>(),
                }),
        }
    }

    /// Convert JSON to the rich value registered for `tag`.
    ///
    /// Without an entry the result is a boxed clone of `value`.
    pub fn deserialize(&self, tag: &str, value: &Value) -> Result<Box<dyn Any + Send>> {
        match self.entries.get(tag) {
            Some(entry) => (entry.deserialize)(value),
            None if self.config.fail_on_missing_entry => {
                Err(MarshalError::NoEntry(TypeTag::from(tag.to_string())))
            }
            None => Ok(Box::new(value.clone())),
        }
    }

    pub fn serialize_as<T: Any>(&self, tag: &str, value: &T) -> Result<Value> {
        self.serialize(tag, value)
    }

    pub fn deserialize_as<T: Any>(&self, tag: &str, value: &Value) -> Result<T> {
        self.deserialize(tag, value)?
            .downcast::<T>()
            .map(|typed| *typed)
            .map_err(|_| MarshalError::TypeMismatch {
                tag: TypeTag::from(tag.to_string()),
                expected: type_name::<T>(),
            })
    }

    /// Check if a tag has a registered entry.
    pub fn has_entry(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    /// Rust type name an entry was registered for.
    pub fn type_name(&self, tag: &str) -> Option<&'static str> {
        self.entries.get(tag).map(|entry| entry.type_name)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&TypeTag> {
        let mut tags: Vec<&TypeTag> = self.entries.keys().collect();
        tags.sort_unstable();
        tags
    }

    pub fn config(&self) -> &MarshalConfig {
        &self.config
    }
}

impl Default for MarshalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MarshalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarshalRegistry")
            .field("tags", &self.tags())
            .field("config", &self.config)
            .finish()
    }
}
