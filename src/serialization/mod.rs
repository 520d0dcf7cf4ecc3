//! CBOR encoding shared by wire messages, stored objects and snapshots.
//!
//! - Use CBOR via `ciborium` for everything that leaves the process
//! - Deterministic output so content hashes are stable across nodes
//! - Schema evolution through `#[serde(default)]` on added fields

use serde::{de::DeserializeOwned, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

/// Serialization errors.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// CBOR encoding failed.
    #[error("CBOR encoding failed: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("CBOR decoding failed: {0}")]
    Decode(String),
}

/// Serialize to CBOR bytes.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, SerializationError> {
    let mut bytes = Vec::new();
    write_cbor(value, &mut bytes)?;
    Ok(bytes)
}

/// Deserialize from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SerializationError> {
    read_cbor(bytes)
}

/// Stream a value as CBOR into `writer`.
pub fn write_cbor<T: Serialize, W: Write>(value: &T, writer: W) -> Result<(), SerializationError> {
    ciborium::into_writer(value, writer).map_err(|e| SerializationError::Encode(format!("{e:?}")))
}

/// Read one CBOR value from `reader`.
pub fn read_cbor<T: DeserializeOwned, R: Read>(reader: R) -> Result<T, SerializationError> {
    ciborium::from_reader(reader).map_err(|e| SerializationError::Decode(format!("{e:?}")))
}
