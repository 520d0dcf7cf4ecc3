//! Per-object holder matrix.

use crate::id::{NodeId, VersionKey};
use crate::manifest::Manifest;
use crate::substrate::Timestamp;
use serde::{Deserialize, Serialize};

/// Capacity of the holder array kept for each fragment.
pub const MAX_HOLDERS_PER_FRAGMENT: usize = 8;

/// One tracked (fragment, holder) pair. `holder == None` is the local node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderSlot {
    pub known: bool,
    pub holder: Option<NodeId>,
    pub dead: bool,
    pub certain: bool,
    pub last_heard: Timestamp,
}

impl HolderSlot {
    pub fn is_live(&self) -> bool {
        self.known && !self.dead
    }

    pub fn is_local(&self) -> bool {
        self.known && self.holder.is_none()
    }

    pub fn remote(&self) -> Option<NodeId> {
        if self.known {
            self.holder
        } else {
            None
        }
    }
}

pub type SlotArray = [HolderSlot; MAX_HOLDERS_PER_FRAGMENT];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub key: VersionKey,
    pub manifest: Manifest,
    slots: Vec<SlotArray>,
    cursor: Vec<usize>,
}

impl FileInfo {
    pub fn new(key: VersionKey, manifest: Manifest, num_fragments: usize) -> Self {
        Self {
            key,
            manifest,
            slots: vec![SlotArray::default(); num_fragments],
            cursor: vec![0; num_fragments],
        }
    }

    pub fn num_fragments(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self, fragment: usize) -> &SlotArray {
        &self.slots[fragment]
    }

    pub fn slots_mut(&mut self, fragment: usize) -> &mut SlotArray {
        &mut self.slots[fragment]
    }

    /// Position of the slot tracking remote `node` for `fragment`.
    pub fn find_remote(&self, fragment: usize, node: &NodeId) -> Option<usize> {
        self.slots[fragment]
            .iter()
            .position(|s| s.known && s.holder.as_ref() == Some(node))
    }

    /// Position of the live local slot for `fragment`.
    pub fn local_slot(&self, fragment: usize) -> Option<usize> {
        self.slots[fragment]
            .iter()
            .position(|s| s.is_local() && !s.dead)
    }

    pub fn has_fragment(&self, fragment: usize) -> bool {
        self.local_slot(fragment).is_some()
    }

    /// Next reusable slot for `fragment`, scanning round-robin from the
    /// fragment's cursor. Empty and dead slots are reusable.
    pub fn next_available_slot(&mut self, fragment: usize) -> Option<usize> {
        let start = self.cursor[fragment];
        for step in 0..MAX_HOLDERS_PER_FRAGMENT {
            let idx = (start + step) % MAX_HOLDERS_PER_FRAGMENT;
            let slot = &self.slots[fragment][idx];
            if !slot.known || slot.dead {
                self.cursor[fragment] = (idx + 1) % MAX_HOLDERS_PER_FRAGMENT;
                return Some(idx);
            }
        }
        None
    }

    /// Indices of fragments stored on this node.
    pub fn local_fragments(&self) -> Vec<usize> {
        (0..self.num_fragments())
            .filter(|&i| self.has_fragment(i))
            .collect()
    }

    /// Number of fragments with at least one live holder.
    pub fn live_fragment_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slots| slots.iter().any(HolderSlot::is_live))
            .count()
    }

    pub fn live_remote_holders(&self, fragment: usize) -> impl Iterator<Item = NodeId> + '_ {
        self.slots[fragment]
            .iter()
            .filter(|s| s.is_live())
            .filter_map(|s| s.holder)
    }

    /// True if `node` is a live holder of any fragment of this object.
    pub fn has_live_holder(&self, node: &NodeId) -> bool {
        self.slots
            .iter()
            .flat_map(|slots| slots.iter())
            .any(|s| s.is_live() && s.holder.as_ref() == Some(node))
    }

    pub fn is_empty(&self) -> bool {
        self.slots
            .iter()
            .flat_map(|slots| slots.iter())
            .all(|s| !s.known)
    }

    /// Iterate `(fragment, slot)` over every known slot.
    pub fn known_slots(&self) -> impl Iterator<Item = (usize, &HolderSlot)> {
        self.slots
            .iter()
            .enumerate()
            .flat_map(|(i, slots)| slots.iter().filter(|s| s.known).map(move |s| (i, s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id;

    fn empty_file() -> FileInfo {
        let manifest = Manifest {
            object_hash: Id::default(),
            fragment_hashes: Vec::new(),
            version: 0,
        };
        FileInfo::new(VersionKey::new(Id::from_prefix(9), 0), manifest, 3)
    }

    #[test]
    fn test_cursor_is_round_robin() {
        let mut file = empty_file();
        let first = file.next_available_slot(0).unwrap();
        file.slots_mut(0)[first].known = true;
        let second = file.next_available_slot(0).unwrap();
        assert_eq!((first, second), (0, 1));
    }

    #[test]
    fn test_full_fragment_has_no_slot() {
        let mut file = empty_file();
        for (i, slot) in file.slots_mut(1).iter_mut().enumerate() {
            slot.known = true;
            slot.holder = Some(Id::from_prefix(i as u64 + 1));
        }
        assert_eq!(file.next_available_slot(1), None);

        file.slots_mut(1)[5].dead = true;
        assert_eq!(file.next_available_slot(1), Some(5));
    }

    #[test]
    fn test_live_fragment_count() {
        let mut file = empty_file();
        file.slots_mut(0)[0] = HolderSlot {
            known: true,
            holder: None,
            dead: false,
            certain: true,
            last_heard: 0,
        };
        file.slots_mut(2)[3] = HolderSlot {
            known: true,
            holder: Some(Id::from_prefix(5)),
            dead: true,
            certain: true,
            last_heard: 0,
        };
        assert_eq!(file.live_fragment_count(), 1);
        assert_eq!(file.local_fragments(), vec![0]);
        assert!(!file.is_empty());
    }
}
