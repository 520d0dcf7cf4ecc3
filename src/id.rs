//! Ring identifiers and fragment addressing.
//!
//! Every node and every object lives on the same 256-bit identifier ring.
//! Objects are addressed by a [`VersionKey`] (key plus version number) and a
//! single erasure-coded share of an object by a [`FragmentKey`].
//!
//! ## Design
//!
//! - **Content addressed**: immutable objects use the SHA-256 of their payload
//! - **Total order**: `FragmentKey` orders by version key, then fragment index
//! - **Ring arithmetic**: distances wrap modulo 2^256

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

/// Width of a ring identifier in bytes.
pub const ID_BYTES: usize = 32;

/// A point on the identifier ring.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Id([u8; ID_BYTES]);

/// Identifier of a node participating in the overlay.
pub type NodeId = Id;

/// Identifier of a stored object.
pub type ObjectKey = Id;

impl Id {
    /// Build an identifier from raw big-endian bytes.
    pub const fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Raw big-endian bytes.
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// SHA-256 of `data`, used as the key of content-hashed objects.
    pub fn for_content(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Most significant 64 bits of the identifier.
    pub fn prefix(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(head)
    }

    /// Identifier whose most significant 64 bits are `prefix` and whose
    /// remaining bits are zero.
    pub fn from_prefix(prefix: u64) -> Self {
        let mut bytes = [0u8; ID_BYTES];
        bytes[..8].copy_from_slice(&prefix.to_be_bytes());
        Self(bytes)
    }

    /// `self - other` modulo 2^256.
    pub fn wrapping_sub(&self, other: &Id) -> Id {
        let mut out = [0u8; ID_BYTES];
        let mut borrow = 0i16;
        for i in (0..ID_BYTES).rev() {
            let mut v = self.0[i] as i16 - other.0[i] as i16 - borrow;
            if v < 0 {
                v += 256;
                borrow = 1;
            } else {
                borrow = 0;
            }
            out[i] = v as u8;
        }
        Id(out)
    }

    /// Shortest distance between two points on the ring, in either direction.
    pub fn distance(&self, other: &Id) -> Id {
        let forward = self.wrapping_sub(other);
        let backward = other.wrapping_sub(self);
        forward.min(backward)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", hex::encode(self.0))
    }
}

/// An object key paired with its version number.
///
/// Content-hashed immutable objects always carry version 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionKey {
    pub key: ObjectKey,
    pub version: u64,
}

impl VersionKey {
    pub fn new(key: ObjectKey, version: u64) -> Self {
        Self { key, version }
    }

    /// Key of fragment `index` of this version.
    pub fn fragment(&self, index: usize) -> FragmentKey {
        FragmentKey {
            version_key: *self,
            index,
        }
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.key, self.version)
    }
}

/// Address of one erasure-coded share of an object version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentKey {
    pub version_key: VersionKey,
    pub index: usize,
}

impl FragmentKey {
    pub fn new(version_key: VersionKey, index: usize) -> Self {
        Self { version_key, index }
    }
}

impl Ord for FragmentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version_key
            .cmp(&other.version_key)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for FragmentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FragmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.version_key, self.index)
    }
}
