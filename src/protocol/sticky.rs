//! Store-and-forward queue for status-casts addressed to unreachable nodes.
//!
//! A neighbour that receives a relayed status keeps it until the real
//! destination shows up in its leaf set, or until the entry has aged out.
//! At most one report is queued per (origin, destination) pair; a newer
//! sequence number replaces an older one.

use super::messages::StatusReport;
use crate::id::NodeId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StickyEntry {
    pub origin: NodeId,
    pub destination: NodeId,
    pub report: StatusReport,
    pub remaining_lifetime: u32,
}

#[derive(Debug, Default)]
pub struct StickyQueue {
    entries: Vec<StickyEntry>,
}

impl StickyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a relayed report. Returns `false` if an equal or newer report
    /// for the same pair is already queued.
    pub fn offer(
        &mut self,
        origin: NodeId,
        destination: NodeId,
        report: StatusReport,
        lifetime: u32,
    ) -> bool {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.origin == origin && e.destination == destination)
        {
            if self.entries[pos].report.seq >= report.seq {
                return false;
            }
            self.entries.remove(pos);
        }
        self.entries.push(StickyEntry {
            origin,
            destination,
            report,
            remaining_lifetime: lifetime,
        });
        true
    }

    /// Remove and return every entry addressed to `destination`.
    pub fn take_for(&mut self, destination: &NodeId) -> Vec<StickyEntry> {
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.destination == *destination);
        self.entries = rest;
        matching
    }

    /// Age every entry by one cycle and drop the expired ones. Returns the
    /// number of entries dropped.
    pub fn expire(&mut self) -> usize {
        let before = self.entries.len();
        for entry in &mut self.entries {
            entry.remaining_lifetime = entry.remaining_lifetime.saturating_sub(1);
        }
        self.entries.retain(|e| e.remaining_lifetime > 0);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StickyEntry> {
        self.entries.iter()
    }
}
