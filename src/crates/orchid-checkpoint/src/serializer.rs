//! Pluggable checkpoint serialization.
//!
//! Backends store checkpoints as opaque byte blobs so that a reader can
//! never observe a half-applied in-place mutation; the serializer decides
//! the encoding. JSON is the default (debuggable, cross-language); bincode
//! trades readability for size and speed.

use crate::error::{CheckpointError, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Encodes and decodes checkpoint payloads.
pub trait Serializer: Send + Sync {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;
    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
    fn name(&self) -> &'static str;
}

/// Human-readable JSON encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(Into::into)
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(Into::into)
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

/// Compact binary encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl Serializer for BincodeSerializer {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| CheckpointError::Serialization(e.to_string()))
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| CheckpointError::Serialization(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "bincode"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use serde_json::json;

    #[test]
    fn json_roundtrip() {
        let serializer = JsonSerializer;
        let cp = Checkpoint::new("t", "e", json!({"k": "v"}));
        let bytes = serializer.to_bytes(&cp).unwrap();
        let back: Checkpoint = serializer.from_bytes(&bytes).unwrap();
        assert_eq!(back, cp);
    }

    #[test]
    fn invalid_bytes_reported_as_serialization_error() {
        let serializer = JsonSerializer;
        let err = serializer.from_bytes::<Checkpoint>(b"not json").unwrap_err();
        assert!(matches!(err, CheckpointError::Serialization(_)));
    }
}
