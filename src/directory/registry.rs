//! Reference-counted table of remote nodes the directory points at.
//!
//! An entry exists exactly while at least one holder slot references the
//! node. Besides the counts it carries the liveness timestamp and the
//! status-cast sequence bookkeeping for that node.

use crate::id::NodeId;
use crate::substrate::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sequence number meaning "nothing received / acknowledged yet".
pub const UNKNOWN_SEQ: i64 = -1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderInfo {
    pub node_id: NodeId,
    pub num_references: u32,
    pub num_live_references: u32,
    pub last_heard_of: Timestamp,
    pub last_acked_seq: i64,
    pub last_received_seq: i64,
}

impl HolderInfo {
    fn new(node_id: NodeId, now: Timestamp) -> Self {
        Self {
            node_id,
            num_references: 0,
            num_live_references: 0,
            last_heard_of: now,
            last_acked_seq: UNKNOWN_SEQ,
            last_received_seq: UNKNOWN_SEQ,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HolderRegistry {
    entries: BTreeMap<NodeId, HolderInfo>,
}

impl HolderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more slot referencing `node`, creating the entry if needed.
    pub fn add_reference(&mut self, node: NodeId, live: bool, now: Timestamp) {
        let info = self
            .entries
            .entry(node)
            .or_insert_with(|| HolderInfo::new(node, now));
        info.num_references += 1;
        if live {
            info.num_live_references += 1;
        }
    }

    /// Drop one slot reference; the entry disappears with its last reference.
    pub fn remove_reference(&mut self, node: &NodeId, live: bool) {
        let Some(info) = self.entries.get_mut(node) else {
            tracing::warn!(holder = %node, "dropping reference to unregistered holder");
            return;
        };
        info.num_references = info.num_references.saturating_sub(1);
        if live {
            info.num_live_references = info.num_live_references.saturating_sub(1);
        }
        if info.num_references == 0 {
            self.entries.remove(node);
        }
    }

    pub fn mark_live(&mut self, node: &NodeId) {
        if let Some(info) = self.entries.get_mut(node) {
            info.num_live_references += 1;
        }
    }

    pub fn mark_dead(&mut self, node: &NodeId) {
        if let Some(info) = self.entries.get_mut(node) {
            info.num_live_references = info.num_live_references.saturating_sub(1);
        }
    }

    pub fn get(&self, node: &NodeId) -> Option<&HolderInfo> {
        self.entries.get(node)
    }

    pub fn get_mut(&mut self, node: &NodeId) -> Option<&mut HolderInfo> {
        self.entries.get_mut(node)
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.entries.contains_key(node)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HolderInfo> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut HolderInfo> {
        self.entries.values_mut()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.entries.keys().copied().collect()
    }

    pub fn remove(&mut self, node: &NodeId) -> Option<HolderInfo> {
        self.entries.remove(node)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace all counts with freshly computed ones and drop entries no slot
    /// references any more. Returns the evicted nodes.
    pub fn recount(&mut self, counts: &BTreeMap<NodeId, (u32, u32)>) -> Vec<NodeId> {
        let mut evicted = Vec::new();
        self.entries.retain(|node, info| match counts.get(node) {
            Some(&(total, live)) if total > 0 => {
                info.num_references = total;
                info.num_live_references = live;
                true
            }
            _ => {
                evicted.push(*node);
                false
            }
        });
        evicted
    }
}
