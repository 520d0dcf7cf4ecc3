//! Erasure coding of serialized objects into fragments.
//!
//! An object is split into `num_fragments` shares of which any
//! `num_survivors` suffice to rebuild it. The rest of the crate only sees
//! the [`ErasureCodec`] trait; [`ReedSolomonCodec`] is the production
//! implementation.

pub mod reed_solomon;

pub use reed_solomon::ReedSolomonCodec;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One erasure-coded share of an object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub index: usize,
    pub payload: Vec<u8>,
}

impl Fragment {
    pub fn new(index: usize, payload: Vec<u8>) -> Self {
        Self { index, payload }
    }
}

/// Errors raised by an erasure codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid coding parameters: {survivors} of {fragments}")]
    InvalidParameters { fragments: usize, survivors: usize },

    #[error("Not enough fragments: need {needed}, got {got}")]
    NotEnoughFragments { needed: usize, got: usize },

    #[error("Fragment index {index} out of range (total {total})")]
    InvalidIndex { index: usize, total: usize },

    #[error("Fragment sizes disagree: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Reconstruction failed: {0}")]
    ReconstructionFailed(String),

    #[error("Decoded payload is corrupt: {0}")]
    Corrupt(String),
}

/// Opaque `encode` / `decode` service.
pub trait ErasureCodec: Send + Sync {
    /// Total number of fragments produced by `encode`.
    fn num_fragments(&self) -> usize;

    /// Minimum number of distinct fragments `decode` needs.
    fn num_survivors(&self) -> usize;

    /// Split `data` into exactly `num_fragments()` fragments, indexed in order.
    fn encode(&self, data: &[u8]) -> Result<Vec<Fragment>, CodecError>;

    /// Rebuild the original bytes from at least `num_survivors()` distinct
    /// fragments.
    fn decode(&self, fragments: &[Fragment]) -> Result<Vec<u8>, CodecError>;
}
