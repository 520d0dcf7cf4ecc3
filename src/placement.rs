//! Deterministic fragment placement on the identifier ring.
//!
//! Fragment `i` of an object is stored at the node closest to
//! `key + (1 + i) / (n + 1)` (as a fraction of the ring), so the `n`
//! fragments of an object are spread evenly and never collide with the
//! object's own primary replica at `key`.
//!
//! ## Design
//!
//! - **Bit-exact**: computed in 64-bit fixed point over the identifier's
//!   most significant bits, so every node derives the same rendezvous point
//! - **Pure**: no dependency on local state or the current ring membership

use crate::id::{FragmentKey, Id, NodeId, ObjectKey};

/// Point on the ring where fragment `fragment_index` of `key` belongs.
///
/// The remaining 192 bits of the result are zero.
pub fn locate(key: &ObjectKey, fragment_index: usize, num_fragments: usize) -> Id {
    let numerator = (1 + fragment_index as u128) << 64;
    let offset = (numerator / (num_fragments as u128 + 1)) as u64;
    Id::from_prefix(key.prefix().wrapping_add(offset))
}

/// Placement point of an addressed fragment.
pub fn locate_fragment(fragment: &FragmentKey, num_fragments: usize) -> Id {
    locate(&fragment.version_key.key, fragment.index, num_fragments)
}

/// True if `candidate` is strictly closer to `target` than `current` is.
pub fn is_closer(candidate: &NodeId, current: &NodeId, target: &Id) -> bool {
    candidate.distance(target) < current.distance(target)
}

/// Node among `candidates` closest to `target`, or `None` if `local` is
/// at least as close as all of them.
pub fn closest_improvement<'a, I>(local: &NodeId, candidates: I, target: &Id) -> Option<NodeId>
where
    I: IntoIterator<Item = &'a NodeId>,
{
    let mut best = *local;
    for candidate in candidates {
        if is_closer(candidate, &best, target) {
            best = *candidate;
        }
    }
    (best != *local).then_some(best)
}
