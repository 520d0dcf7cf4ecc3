//! Status-casts and sticky relay.
//!
//! Once per cycle every registered holder receives either the history
//! events about objects it helps store (diff) or every live entry of those
//! objects (full). A holder whose acknowledgement lags behind the retained
//! history, or is unknown, gets the full list.
//!
//! A status that reaches a node other than its destination means the
//! destination is unreachable. The receiving node queues it and hands it
//! to its leaf set as a sticky message, to be delivered when the
//! destination comes back.

use super::Glacier;
use crate::directory::{EventKind, HistoryEvent, UNKNOWN_SEQ};
use crate::error::Result;
use crate::id::{Id, NodeId};
use crate::protocol::{Message, StatusReport};

impl Glacier {
    /// Send this round's status to every registered holder.
    pub(super) fn status_cast(&mut self) {
        let seq = self.directory.current_seq();
        let window = self.config.protocol.num_include_previous_status_casts;
        let mut full_casts = 0;

        let outgoing: Vec<(NodeId, StatusReport)> = self
            .directory
            .registry()
            .iter()
            .map(|info| {
                let full = info.last_acked_seq == UNKNOWN_SEQ
                    || info.last_acked_seq < seq - window - 1;
                if full {
                    full_casts += 1;
                }
                let events = if full {
                    self.full_events_for(&info.node_id, seq)
                } else {
                    self.diff_events_for(&info.node_id, info.last_acked_seq)
                };
                (
                    info.node_id,
                    StatusReport {
                        seq,
                        ack_seq: info.last_received_seq,
                        full,
                        events,
                    },
                )
            })
            .collect();

        tracing::info!(
            seq,
            holders = outgoing.len(),
            full = full_casts,
            "status-cast"
        );
        for (node, report) in outgoing {
            self.send(node, Message::Status(report));
        }
        self.directory.advance_seq(window);
    }

    /// History events after `acked` about objects `node` is a live holder of.
    fn diff_events_for(&self, node: &NodeId, acked: i64) -> Vec<HistoryEvent> {
        self.directory
            .history()
            .iter()
            .filter(|event| event.seq > acked)
            .filter(|event| {
                self.directory
                    .file(&event.key.version_key)
                    .is_some_and(|file| file.has_live_holder(node))
            })
            .copied()
            .collect()
    }

    /// Every live entry of the objects `node` is a live holder of.
    fn full_events_for(&self, node: &NodeId, seq: i64) -> Vec<HistoryEvent> {
        let local = self.local_id();
        self.directory
            .files()
            .filter(|file| file.has_live_holder(node))
            .flat_map(|file| {
                file.known_slots()
                    .filter(|(_, slot)| !slot.dead)
                    .map(move |(index, slot)| {
                        let key = file.key.fragment(index);
                        match slot.holder {
                            None => HistoryEvent::new(EventKind::Acquired, key, local, seq),
                            Some(holder) => {
                                HistoryEvent::new(EventKind::NewHolder, key, holder, seq)
                            }
                        }
                    })
            })
            .collect()
    }

    pub(super) fn on_status(
        &mut self,
        source: NodeId,
        destination: Id,
        report: StatusReport,
    ) -> Result<()> {
        if destination == self.local_id() {
            return self.apply_status(source, report);
        }

        let lifetime = self.config.protocol.sticky_packet_lifetime;
        tracing::debug!(
            origin = %source,
            destination = %destination,
            seq = report.seq,
            "status for unreachable node, relaying"
        );
        self.sticky
            .offer(source, destination, report.clone(), lifetime);
        for neighbour in self.overlay.leaf_set() {
            if neighbour == destination {
                continue;
            }
            self.send(
                neighbour,
                Message::Sticky {
                    origin: source,
                    destination,
                    report: report.clone(),
                    ttl: lifetime,
                },
            );
        }
        Ok(())
    }

    pub(super) fn on_sticky(
        &mut self,
        origin: NodeId,
        destination: NodeId,
        report: StatusReport,
        ttl: u32,
    ) -> Result<()> {
        if destination == self.local_id() {
            tracing::debug!(origin = %origin, seq = report.seq, "sticky status delivered");
            return self.apply_status(origin, report);
        }
        let lifetime = ttl.min(self.config.protocol.sticky_packet_lifetime);
        if lifetime == 0 {
            return Ok(());
        }
        if self.sticky.offer(origin, destination, report, lifetime) {
            tracing::debug!(origin = %origin, destination = %destination, "sticky status queued");
        }
        Ok(())
    }

    /// Hand queued sticky statuses to a node that just joined the leaf set.
    pub(super) fn on_leaf_set_change(&mut self, node: NodeId, joined: bool) {
        if !joined {
            tracing::debug!(node = %node, "leaf-set neighbour left");
            return;
        }
        for entry in self.sticky.take_for(&node) {
            tracing::debug!(origin = %entry.origin, destination = %node, "delivering sticky status");
            self.send(
                node,
                Message::Sticky {
                    origin: entry.origin,
                    destination: node,
                    report: entry.report,
                    ttl: entry.remaining_lifetime,
                },
            );
        }
    }

    /// Apply a status from `origin`. Reports at or below the last applied
    /// sequence number are duplicates or late sticky deliveries and only
    /// count as a sign of life. After a gap the origin stays unsynchronised
    /// until a full report arrives.
    fn apply_status(&mut self, origin: NodeId, report: StatusReport) -> Result<()> {
        let Some(info) = self.directory.registry().get(&origin) else {
            tracing::debug!(origin = %origin, "status from unregistered node ignored");
            return Ok(());
        };
        let last = info.last_received_seq;
        let window = self.config.protocol.num_include_previous_status_casts;
        let now = self.clock.now();

        if last != UNKNOWN_SEQ && report.seq <= last {
            tracing::debug!(origin = %origin, seq = report.seq, last, "stale status ignored");
            if let Some(info) = self.directory.registry_mut().get_mut(&origin) {
                info.last_heard_of = now;
            }
            self.dirty = true;
            return Ok(());
        }

        let mut applied = 0;
        for event in report.events.iter().filter(|event| event.seq > last) {
            let news = self.directory.add_fragment_news(
                &event.key,
                event.holder,
                event.kind,
                Some(origin),
                now,
            );
            self.escalate(news)?;
            applied += 1;
        }
        self.directory.refresh_confirmed_for(&origin, now);

        let gap = !report.full && report.seq > last + window;
        if gap {
            tracing::info!(
                origin = %origin,
                seq = report.seq,
                last,
                "status gap, requesting full resync"
            );
        }
        if let Some(info) = self.directory.registry_mut().get_mut(&origin) {
            info.last_heard_of = now;
            info.last_acked_seq = report.ack_seq;
            info.last_received_seq = if gap { UNKNOWN_SEQ } else { report.seq };
        }
        self.dirty = true;
        tracing::debug!(origin = %origin, seq = report.seq, full = report.full, applied, "status applied");
        Ok(())
    }
}
