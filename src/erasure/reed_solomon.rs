//! Reed-Solomon codec over GF(2^8).
//!
//! The first `num_survivors` fragments are data shards and the remaining
//! ones parity shards. The payload is prefixed with its length (8 bytes,
//! little endian) and zero-padded to a multiple of the data shard count, so
//! decoding can strip the padding again.

use super::{CodecError, ErasureCodec, Fragment};
use reed_solomon_erasure::galois_8::ReedSolomon;

const LENGTH_PREFIX: usize = 8;

/// Maximum shard count supported by GF(2^8).
pub const MAX_FRAGMENTS: usize = 255;

pub struct ReedSolomonCodec {
    fragments: usize,
    survivors: usize,
    rs: ReedSolomon,
}

impl ReedSolomonCodec {
    pub fn new(num_fragments: usize, num_survivors: usize) -> Result<Self, CodecError> {
        let invalid = CodecError::InvalidParameters {
            fragments: num_fragments,
            survivors: num_survivors,
        };
        if num_survivors == 0 || num_survivors >= num_fragments || num_fragments > MAX_FRAGMENTS {
            return Err(invalid);
        }
        let rs = ReedSolomon::new(num_survivors, num_fragments - num_survivors)
            .map_err(|_| invalid)?;
        Ok(Self {
            fragments: num_fragments,
            survivors: num_survivors,
            rs,
        })
    }
}

impl std::fmt::Debug for ReedSolomonCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReedSolomonCodec")
            .field("fragments", &self.fragments)
            .field("survivors", &self.survivors)
            .finish()
    }
}

impl ErasureCodec for ReedSolomonCodec {
    fn num_fragments(&self) -> usize {
        self.fragments
    }

    fn num_survivors(&self) -> usize {
        self.survivors
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<Fragment>, CodecError> {
        let framed_len = data.len() + LENGTH_PREFIX;
        let shard_len = framed_len.div_ceil(self.survivors);

        let mut framed = Vec::with_capacity(shard_len * self.survivors);
        framed.extend_from_slice(&(data.len() as u64).to_le_bytes());
        framed.extend_from_slice(data);
        framed.resize(shard_len * self.survivors, 0);

        let mut shards: Vec<Vec<u8>> = framed.chunks(shard_len).map(<[u8]>::to_vec).collect();
        shards.resize(self.fragments, vec![0u8; shard_len]);

        self.rs
            .encode(&mut shards)
            .map_err(|e| CodecError::EncodingFailed(format!("{e:?}")))?;

        Ok(shards
            .into_iter()
            .enumerate()
            .map(|(index, payload)| Fragment { index, payload })
            .collect())
    }

    fn decode(&self, fragments: &[Fragment]) -> Result<Vec<u8>, CodecError> {
        let mut buffers: Vec<Option<Vec<u8>>> = vec![None; self.fragments];
        let mut shard_len = None;
        let mut present = 0;

        for fragment in fragments {
            if fragment.index >= self.fragments {
                return Err(CodecError::InvalidIndex {
                    index: fragment.index,
                    total: self.fragments,
                });
            }
            match shard_len {
                None => shard_len = Some(fragment.payload.len()),
                Some(expected) if expected != fragment.payload.len() => {
                    return Err(CodecError::SizeMismatch {
                        expected,
                        actual: fragment.payload.len(),
                    });
                }
                Some(_) => {}
            }
            if buffers[fragment.index].is_none() {
                buffers[fragment.index] = Some(fragment.payload.clone());
                present += 1;
            }
        }

        if present < self.survivors {
            return Err(CodecError::NotEnoughFragments {
                needed: self.survivors,
                got: present,
            });
        }

        self.rs
            .reconstruct_data(&mut buffers)
            .map_err(|e| CodecError::ReconstructionFailed(format!("{e:?}")))?;

        let mut framed = Vec::new();
        for shard in buffers.into_iter().take(self.survivors) {
            let shard = shard.ok_or_else(|| {
                CodecError::ReconstructionFailed("data shard missing after reconstruction".into())
            })?;
            framed.extend_from_slice(&shard);
        }

        if framed.len() < LENGTH_PREFIX {
            return Err(CodecError::Corrupt("missing length prefix".into()));
        }
        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&framed[..LENGTH_PREFIX]);
        let len = u64::from_le_bytes(prefix) as usize;
        if len > framed.len() - LENGTH_PREFIX {
            return Err(CodecError::Corrupt(format!(
                "length prefix {len} exceeds {} decoded bytes",
                framed.len() - LENGTH_PREFIX
            )));
        }
        framed.truncate(LENGTH_PREFIX + len);
        framed.drain(..LENGTH_PREFIX);
        Ok(framed)
    }
}
