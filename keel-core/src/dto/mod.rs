//! Data Transfer Objects for the client-facing layer
//!
//! DTOs are the serializable projections exchanged with clients and nodes.
//! Every DTO names its wire keys explicitly through [`WireModel`], absent
//! optional fields are omitted from the wire form, and equality is field-wise.

pub mod job;
pub mod node;

use serde::Serialize;
use serde_json::{Map, Value};

/// Static serialization capability shared by all DTOs
///
/// `WIRE_KEYS` maps each Rust field name to the JSON key it travels under.
/// The serde attributes on the type must produce exactly these keys.
pub trait WireModel: Serialize {
    const WIRE_KEYS: &'static [(&'static str, &'static str)];

    /// Wire key for a field, if the field exists
    fn wire_key(field: &str) -> Option<&'static str> {
        Self::WIRE_KEYS
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, key)| *key)
    }

    /// Field name for a wire key, if the key exists
    fn field_name(key: &str) -> Option<&'static str> {
        Self::WIRE_KEYS
            .iter()
            .find(|(_, wire)| *wire == key)
            .map(|(name, _)| *name)
    }

    /// Serializes into a JSON object keyed by wire keys
    fn to_wire(&self) -> serde_json::Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
                "expected a JSON object, got {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::WireModel;
    use std::collections::BTreeSet;

    /// Asserts that a fully populated value serializes to exactly the declared keys
    pub fn assert_wire_keys<T: WireModel>(value: &T) {
        let emitted: BTreeSet<String> = value.to_wire().unwrap().keys().cloned().collect();
        let declared: BTreeSet<String> = T::WIRE_KEYS.iter().map(|(_, k)| k.to_string()).collect();
        assert_eq!(emitted, declared);

        for (field, key) in T::WIRE_KEYS {
            assert_eq!(T::wire_key(field), Some(*key));
            assert_eq!(T::field_name(key), Some(*field));
        }
    }
}
