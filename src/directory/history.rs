//! Ordered log of holder-change events feeding incremental status-casts.

use crate::id::{FragmentKey, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// `holder` now stores the fragment (direct evidence).
    Acquired,
    /// The event's sender handed the fragment off to `holder`.
    HandedOff,
    /// `holder` is believed to store the fragment (hearsay).
    NewHolder,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Acquired => "acquired",
            EventKind::HandedOff => "handed-off",
            EventKind::NewHolder => "new-holder",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub kind: EventKind,
    pub key: FragmentKey,
    pub holder: NodeId,
    pub seq: i64,
}

impl HistoryEvent {
    pub fn new(kind: EventKind, key: FragmentKey, holder: NodeId, seq: i64) -> Self {
        Self {
            kind,
            key,
            holder,
            seq,
        }
    }
}

/// Append-only event log, ordered by sequence number.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistoryLog {
    events: VecDeque<HistoryEvent>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EventKind, key: FragmentKey, holder: NodeId, seq: i64) {
        self.events.push_back(HistoryEvent::new(kind, key, holder, seq));
    }

    /// Drop every event with a sequence number below `min_seq`.
    pub fn prune(&mut self, min_seq: i64) {
        while self.events.front().is_some_and(|e| e.seq < min_seq) {
            self.events.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
