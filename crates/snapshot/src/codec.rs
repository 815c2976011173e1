//! Pluggable value encodings.

use deferq_core::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Encoding strategy used to turn a snapshot into bytes and back.
pub trait Codec: Send + Sync + std::fmt::Debug + 'static {
    /// Encode `value`.
    ///
    /// # Errors
    ///
    /// Returns `SerializationFailed` if the value cannot be encoded.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode a value from `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `SerializationFailed` if the bytes are not a valid encoding.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// Pretty-printed JSON. The default, human-readable encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(value).map_err(Error::serialization_failed)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(Error::serialization_failed)
    }
}

/// Compact binary encoding via bincode's standard configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(Error::serialization_failed)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(Error::serialization_failed)
    }
}
