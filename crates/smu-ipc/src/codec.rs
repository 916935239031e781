use serde::{Serialize, de::DeserializeOwned};

use crate::IpcError;

/// Serializes a value to a single-line JSON document.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, IpcError> {
    serde_json::to_vec(value).map_err(|err| IpcError::Encode(err.to_string()))
}

/// Deserializes one JSON frame payload into a typed value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, IpcError> {
    serde_json::from_slice(bytes).map_err(|err| IpcError::Decode(err.to_string()))
}
