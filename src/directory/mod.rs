//! Holder directory: who holds which fragment of which object.
//!
//! The directory is the single mutable source of truth shared by every
//! protocol phase. It combines:
//!
//! - **FileInfo**: a fixed-capacity holder matrix per object version
//! - **HolderRegistry**: reference-counted table of the remote nodes in use
//! - **HistoryLog**: the holder-change events not yet fully gossiped
//!
//! ## Update policy
//!
//! | Event | Effect |
//! |---|---|
//! | Acquired | holder added or revived, alive and certain |
//! | HandedOff | sender marked dead but certain, new holder alive but uncertain |
//! | NewHolder | holder added alive and uncertain, never revives a dead entry |
//!
//! Running out of holder slots for a fragment is a checked
//! [`DirectoryError::CapacityExceeded`]; the engine treats it as fatal.

pub mod file_info;
pub mod history;
pub mod registry;

#[cfg(test)]
mod proptests;

pub use file_info::{FileInfo, HolderSlot, MAX_HOLDERS_PER_FRAGMENT};
pub use history::{EventKind, HistoryEvent, HistoryLog};
pub use registry::{HolderInfo, HolderRegistry, UNKNOWN_SEQ};

use crate::id::{FragmentKey, NodeId, VersionKey};
use crate::manifest::Manifest;
use crate::protocol::KnownHolder;
use crate::substrate::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("No free holder slot for {key} (capacity {capacity})")]
    CapacityExceeded { key: FragmentKey, capacity: usize },

    #[error("Fragment index out of range: {key} (object has {num_fragments})")]
    InvalidFragment {
        key: FragmentKey,
        num_fragments: usize,
    },

    #[error("Object not tracked: {0}")]
    UnknownFile(VersionKey),
}

/// Ages after which directory entries are forgotten, in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub dead_ms: u64,
    pub uncertain_ms: u64,
    pub certain_ms: u64,
}

/// What one expiry pass removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    pub silent_holders: Vec<NodeId>,
    pub forgotten_slots: usize,
    pub evicted_holders: Vec<NodeId>,
    pub dropped_files: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HolderDirectory {
    local_id: NodeId,
    num_fragments: usize,
    files: BTreeMap<VersionKey, FileInfo>,
    registry: HolderRegistry,
    history: HistoryLog,
    current_seq: i64,
    last_status_cast: Timestamp,
}

impl HolderDirectory {
    pub fn new(local_id: NodeId, num_fragments: usize) -> Self {
        Self {
            local_id,
            num_fragments,
            files: BTreeMap::new(),
            registry: HolderRegistry::new(),
            history: HistoryLog::new(),
            current_seq: 0,
            last_status_cast: 0,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn num_fragments(&self) -> usize {
        self.num_fragments
    }

    pub fn file(&self, key: &VersionKey) -> Option<&FileInfo> {
        self.files.get(key)
    }

    pub fn file_mut(&mut self, key: &VersionKey) -> Option<&mut FileInfo> {
        self.files.get_mut(key)
    }

    pub fn files(&self) -> impl Iterator<Item = &FileInfo> {
        self.files.values()
    }

    pub fn file_keys(&self) -> Vec<VersionKey> {
        self.files.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn registry(&self) -> &HolderRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut HolderRegistry {
        &mut self.registry
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn current_seq(&self) -> i64 {
        self.current_seq
    }

    pub fn last_status_cast(&self) -> Timestamp {
        self.last_status_cast
    }

    pub fn set_last_status_cast(&mut self, at: Timestamp) {
        self.last_status_cast = at;
    }

    /// Close the current status-cast round and prune history nobody can
    /// still need for an incremental update.
    pub fn advance_seq(&mut self, resync_window: i64) {
        self.current_seq += 1;
        self.history.prune(self.current_seq - resync_window);
    }

    fn check_index(&self, key: &FragmentKey) -> Result<(), DirectoryError> {
        if key.index >= self.num_fragments {
            return Err(DirectoryError::InvalidFragment {
                key: *key,
                num_fragments: self.num_fragments,
            });
        }
        Ok(())
    }

    /// Record that `holder` does (`alive`) or no longer does hold `key`.
    ///
    /// A dead entry is only revived when `override_dead` is set.
    pub fn add_or_update_holder(
        &mut self,
        key: &FragmentKey,
        holder: NodeId,
        alive: bool,
        override_dead: bool,
        certain: bool,
        now: Timestamp,
    ) -> Result<(), DirectoryError> {
        self.check_index(key)?;
        if holder == self.local_id {
            return Ok(());
        }
        let file = self
            .files
            .get_mut(&key.version_key)
            .ok_or(DirectoryError::UnknownFile(key.version_key))?;
        let fragment = key.index;

        if let Some(idx) = file.find_remote(fragment, &holder) {
            let slot = &mut file.slots_mut(fragment)[idx];
            if slot.dead {
                if alive && override_dead {
                    tracing::debug!(key = %key, holder = %holder, "reviving holder");
                    slot.dead = false;
                    slot.certain = certain;
                    slot.last_heard = now;
                    self.registry.mark_live(&holder);
                    self.history
                        .record(EventKind::NewHolder, *key, holder, self.current_seq);
                }
            } else if !alive {
                tracing::debug!(key = %key, holder = %holder, "holder is gone");
                slot.dead = true;
                slot.certain = certain;
                slot.last_heard = now;
                self.registry.mark_dead(&holder);
            } else {
                if certain && !slot.certain {
                    slot.certain = true;
                }
                if certain == slot.certain {
                    slot.last_heard = now;
                }
            }
            return Ok(());
        }

        let idx = file
            .next_available_slot(fragment)
            .ok_or(DirectoryError::CapacityExceeded {
                key: *key,
                capacity: MAX_HOLDERS_PER_FRAGMENT,
            })?;
        let evicted = file.slots(fragment)[idx];
        if let Some(old) = evicted.remote() {
            self.registry.remove_reference(&old, !evicted.dead);
        }
        file.slots_mut(fragment)[idx] = HolderSlot {
            known: true,
            holder: Some(holder),
            dead: !alive,
            certain,
            last_heard: now,
        };
        self.registry.add_reference(holder, alive, now);
        Ok(())
    }

    /// Apply one piece of holder news, as received in a status-cast or an
    /// insert. `sender` is the node that reported it.
    pub fn add_fragment_news(
        &mut self,
        key: &FragmentKey,
        new_holder: NodeId,
        kind: EventKind,
        sender: Option<NodeId>,
        now: Timestamp,
    ) -> Result<(), DirectoryError> {
        self.check_index(key)?;
        if new_holder == self.local_id {
            return Ok(());
        }
        let Some(file) = self.files.get(&key.version_key) else {
            tracing::debug!(key = %key, "news about untracked object ignored");
            return Ok(());
        };
        if file.has_fragment(key.index) {
            tracing::warn!(key = %key, "told about a fragment this node holds, ignoring");
            return Ok(());
        }

        match kind {
            EventKind::Acquired => self.add_or_update_holder(key, new_holder, true, true, true, now),
            EventKind::HandedOff => {
                if let Some(sender) = sender {
                    self.add_or_update_holder(key, sender, false, false, true, now)?;
                }
                self.add_or_update_holder(key, new_holder, true, true, false, now)
            }
            EventKind::NewHolder => {
                self.add_or_update_holder(key, new_holder, true, false, false, now)
            }
        }
    }

    /// Register a fragment that was just written to local storage.
    pub fn mark_new_fragment_stored(
        &mut self,
        key: &FragmentKey,
        manifest: &Manifest,
        now: Timestamp,
    ) -> Result<(), DirectoryError> {
        self.check_index(key)?;
        let num_fragments = self.num_fragments;
        let file = self
            .files
            .entry(key.version_key)
            .or_insert_with(|| FileInfo::new(key.version_key, manifest.clone(), num_fragments));
        if file.has_fragment(key.index) {
            return Ok(());
        }

        let idx = file
            .next_available_slot(key.index)
            .ok_or(DirectoryError::CapacityExceeded {
                key: *key,
                capacity: MAX_HOLDERS_PER_FRAGMENT,
            })?;
        let evicted = file.slots(key.index)[idx];
        if let Some(old) = evicted.remote() {
            self.registry.remove_reference(&old, !evicted.dead);
        }
        file.slots_mut(key.index)[idx] = HolderSlot {
            known: true,
            holder: None,
            dead: false,
            certain: true,
            last_heard: now,
        };
        self.history
            .record(EventKind::Acquired, *key, self.local_id, self.current_seq);
        Ok(())
    }

    /// Mark a live remote holder of `key` as dead, if tracked.
    pub fn kill_holder(&mut self, key: &FragmentKey, node: &NodeId) {
        let Some(file) = self.files.get_mut(&key.version_key) else {
            return;
        };
        if let Some(idx) = file.find_remote(key.index, node) {
            let slot = &mut file.slots_mut(key.index)[idx];
            if !slot.dead {
                slot.dead = true;
                self.registry.mark_dead(node);
            }
        }
    }

    /// Mark the local copy of `key` dead (it is being discarded).
    pub fn mark_local_dead(&mut self, key: &FragmentKey) {
        if let Some(file) = self.files.get_mut(&key.version_key) {
            if let Some(idx) = file.local_slot(key.index) {
                file.slots_mut(key.index)[idx].dead = true;
            }
        }
    }

    /// Forget the local copy of `key` entirely.
    pub fn forget_local(&mut self, key: &FragmentKey) {
        if let Some(file) = self.files.get_mut(&key.version_key) {
            if let Some(idx) = file.local_slot(key.index) {
                file.slots_mut(key.index)[idx].known = false;
            }
        }
    }

    /// Log that `key` moved from this node to `new_holder`.
    pub fn record_migrated(&mut self, key: &FragmentKey, new_holder: NodeId) {
        if new_holder == self.local_id {
            tracing::debug!(key = %key, "fragment migrated to this node, not logged");
            return;
        }
        self.history
            .record(EventKind::HandedOff, *key, new_holder, self.current_seq);
    }

    /// Refresh every confirmed, live entry naming `node`: a status-cast
    /// that does not mention them means they are unchanged.
    pub fn refresh_confirmed_for(&mut self, node: &NodeId, now: Timestamp) {
        for file in self.files.values_mut() {
            for fragment in 0..file.num_fragments() {
                for slot in file.slots_mut(fragment).iter_mut() {
                    if slot.is_live() && slot.certain && slot.holder.as_ref() == Some(node) {
                        slot.last_heard = now;
                    }
                }
            }
        }
    }

    /// Live holders of other fragments of `version_key`, for seeding a
    /// receiver's directory. The local copy of `exclude_local` is left out.
    pub fn known_holders(&self, version_key: &VersionKey, exclude_local: usize) -> Vec<KnownHolder> {
        let Some(file) = self.files.get(version_key) else {
            return Vec::new();
        };
        file.known_slots()
            .filter(|(_, slot)| !slot.dead)
            .filter(|(index, slot)| !(slot.holder.is_none() && *index == exclude_local))
            .map(|(index, slot)| KnownHolder {
                index,
                holder: slot.holder.unwrap_or(self.local_id),
                certain: slot.certain,
            })
            .collect()
    }

    /// `(references, live references)` per remote node, counted from the
    /// holder slots.
    pub fn count_references(&self) -> BTreeMap<NodeId, (u32, u32)> {
        let mut counts: BTreeMap<NodeId, (u32, u32)> = BTreeMap::new();
        for file in self.files.values() {
            for (_, slot) in file.known_slots() {
                if let Some(node) = slot.holder {
                    let entry = counts.entry(node).or_default();
                    entry.0 += 1;
                    if !slot.dead {
                        entry.1 += 1;
                    }
                }
            }
        }
        counts
    }

    /// Forget stale entries and evict holders nothing refers to any more.
    pub fn expire(&mut self, now: Timestamp, policy: &ExpiryPolicy) -> ExpiryReport {
        let older_than = |at: Timestamp, age: u64| at.saturating_add(age) < now;

        let silent: BTreeSet<NodeId> = self
            .registry
            .iter()
            .filter(|info| older_than(info.last_heard_of, policy.certain_ms))
            .map(|info| info.node_id)
            .collect();

        let mut report = ExpiryReport {
            silent_holders: silent.iter().copied().collect(),
            ..ExpiryReport::default()
        };

        for file in self.files.values_mut() {
            let file_key = file.key;
            for fragment in 0..file.num_fragments() {
                for slot in file.slots_mut(fragment).iter_mut() {
                    let Some(node) = slot.remote() else {
                        continue;
                    };
                    let forget = silent.contains(&node)
                        || (slot.dead && older_than(slot.last_heard, policy.dead_ms))
                        || (!slot.dead
                            && !slot.certain
                            && older_than(slot.last_heard, policy.uncertain_ms));
                    if forget {
                        tracing::debug!(file = %file_key, fragment, holder = %node, "holder entry expired");
                        slot.known = false;
                        report.forgotten_slots += 1;
                    }
                }
            }
        }

        let before = self.files.len();
        self.files.retain(|_, file| !file.is_empty());
        report.dropped_files = before - self.files.len();

        let counts = self.count_references();
        report.evicted_holders = self.registry.recount(&counts);
        for node in &silent {
            self.registry.remove(node);
        }
        report
    }

    /// Restart gossip from scratch after a global restart: re-announce local
    /// fragments, downgrade remote knowledge to uncertain and forget the dead.
    pub fn refreeze(&mut self, now: Timestamp) {
        self.history.clear();
        let seq = self.current_seq;
        let local_id = self.local_id;

        for file in self.files.values_mut() {
            let version_key = file.key;
            for fragment in 0..file.num_fragments() {
                for slot in file.slots_mut(fragment).iter_mut() {
                    if !slot.known {
                        continue;
                    }
                    if slot.dead {
                        slot.known = false;
                    } else if slot.holder.is_none() {
                        slot.last_heard = now;
                        self.history.record(
                            EventKind::Acquired,
                            version_key.fragment(fragment),
                            local_id,
                            seq,
                        );
                    } else {
                        slot.certain = false;
                        slot.last_heard = now;
                    }
                }
            }
        }

        let counts = self.count_references();
        self.registry.recount(&counts);
        for info in self.registry.iter_mut() {
            info.last_heard_of = now;
        }
    }
}
