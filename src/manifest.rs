//! Stored objects and their storage manifests.
//!
//! A [`StoredObject`] is what the primary store keeps as a full replica. Its
//! CBOR encoding is the byte string handed to the erasure codec. The
//! [`Manifest`] records content hashes of that encoding and of every
//! fragment, so holders can reject corrupt or forged shares before storing
//! them.

use crate::erasure::{CodecError, ErasureCodec, Fragment};
use crate::id::{Id, ObjectKey, VersionKey};
use crate::serialization::{from_cbor, to_cbor, SerializationError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Object encoding failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Erasure coding failed: {0}")]
    Codec(#[from] CodecError),
}

/// Full replica of an object as held by the primary store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub key: ObjectKey,
    pub version: u64,
    pub mutable: bool,
    pub payload: Vec<u8>,
}

impl StoredObject {
    /// Immutable object keyed by the hash of its payload, at version 0.
    pub fn immutable(payload: Vec<u8>) -> Self {
        Self {
            key: Id::for_content(&payload),
            version: 0,
            mutable: false,
            payload,
        }
    }

    pub fn mutable(key: ObjectKey, version: u64, payload: Vec<u8>) -> Self {
        Self {
            key,
            version,
            mutable: true,
            payload,
        }
    }

    pub fn version_key(&self) -> VersionKey {
        VersionKey::new(self.key, self.version)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        to_cbor(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        from_cbor(bytes)
    }

    /// Serialize and erasure-code this object, returning its manifest and
    /// all fragments.
    pub fn encode(
        &self,
        codec: &dyn ErasureCodec,
    ) -> Result<(Manifest, Vec<Fragment>), ManifestError> {
        let bytes = self.to_bytes()?;
        let fragments = codec.encode(&bytes)?;
        let manifest = Manifest::for_fragments(&bytes, &fragments, self.version);
        Ok((manifest, fragments))
    }
}

/// Content hashes of an encoded object and each of its fragments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub object_hash: Id,
    pub fragment_hashes: Vec<Id>,
    pub version: u64,
}

impl Manifest {
    pub fn for_fragments(object_bytes: &[u8], fragments: &[Fragment], version: u64) -> Self {
        Self {
            object_hash: Id::for_content(object_bytes),
            fragment_hashes: fragments
                .iter()
                .map(|f| Id::for_content(&f.payload))
                .collect(),
            version,
        }
    }

    pub fn verifies_object(&self, object_bytes: &[u8]) -> bool {
        Id::for_content(object_bytes) == self.object_hash
    }

    pub fn verifies_fragment(&self, fragment: &Fragment) -> bool {
        self.fragment_hashes
            .get(fragment.index)
            .is_some_and(|hash| *hash == Id::for_content(&fragment.payload))
    }
}
