//! Fragment migration toward better-placed holders.
//!
//! A job is created either for a local fragment whose placement point is
//! now closer to a leaf-set neighbour, or for a fragment regenerated by a
//! restore. Both are placed the same way:
//!
//! ```text
//! Query   -> destination
//! Response(have_it = false) <-  Insert -> holder, Receipt <-
//! Response(have_it = true)  <-  collision, nothing to send
//! ```
//!
//! Unconfirmed migrations are dropped when the hand-off timer fires and
//! are planned afresh in the next cycle. A restored fragment exists only in
//! its job, so that job is kept and queried again until it is placed.

use super::{Glacier, TimerKind};
use crate::directory::EventKind;
use crate::erasure::Fragment;
use crate::error::Result;
use crate::id::{FragmentKey, Id, NodeId};
use crate::manifest::Manifest;
use crate::placement::{closest_improvement, locate_fragment};
use crate::protocol::Message;

#[derive(Clone, Debug)]
pub struct HandoffJob {
    pub(super) key: FragmentKey,
    pub(super) destination: Id,
    pub(super) fragment: Fragment,
    pub(super) manifest: Manifest,
    pub(super) restored: bool,
}

impl HandoffJob {
    pub(super) fn restored(
        key: FragmentKey,
        destination: Id,
        fragment: Fragment,
        manifest: Manifest,
    ) -> Self {
        Self {
            key,
            destination,
            fragment,
            manifest,
            restored: true,
        }
    }

    pub fn key(&self) -> FragmentKey {
        self.key
    }

    pub fn destination(&self) -> Id {
        self.destination
    }

    /// True for a fragment regenerated by a restore.
    pub fn is_restored(&self) -> bool {
        self.restored
    }
}

impl Glacier {
    /// Plan migrations and query every pending hand-off destination.
    pub(super) async fn begin_handoffs(&mut self) -> Result<()> {
        let local = self.local_id();
        let n = self.directory.num_fragments();
        let leaf_set = self.overlay.leaf_set();

        let mut planned: Vec<(FragmentKey, NodeId)> = Vec::new();
        for file in self.directory.files() {
            for index in file.local_fragments() {
                let key = file.key.fragment(index);
                if self.handoffs.contains_key(&key) {
                    continue;
                }
                let target = locate_fragment(&key, n);
                if let Some(better) = closest_improvement(&local, &leaf_set, &target) {
                    planned.push((key, better));
                    break;
                }
            }
        }

        for (key, destination) in planned {
            match self.fragments.get(&key).await? {
                Some(stored) => {
                    tracing::debug!(key = %key, destination = %destination, "planning hand-off");
                    self.handoffs.insert(
                        key,
                        HandoffJob {
                            key,
                            destination,
                            fragment: stored.fragment,
                            manifest: stored.manifest,
                            restored: false,
                        },
                    );
                }
                None => tracing::warn!(key = %key, "cannot hand off, fragment missing from store"),
            }
        }

        let queries: Vec<(FragmentKey, Id)> = self
            .handoffs
            .values()
            .map(|job| (job.key, job.destination))
            .collect();
        if !queries.is_empty() {
            tracing::info!(jobs = queries.len(), "handing off fragments");
        }
        for (key, destination) in queries {
            self.send(destination, Message::Query { key });
        }

        let timeout = self.config.timing.handoff_timeout;
        self.arm_timer(TimerKind::Handoff, timeout);
        Ok(())
    }

    pub(super) async fn on_handoff_response(
        &mut self,
        source: NodeId,
        key: FragmentKey,
        have_it: bool,
    ) -> Result<()> {
        let Some(job) = self.handoffs.get(&key) else {
            return Ok(());
        };

        if !have_it {
            let message = Message::Insert {
                key,
                manifest: job.manifest.clone(),
                fragment: job.fragment.clone(),
                known_holders: self.directory.known_holders(&key.version_key, key.index),
            };
            tracing::debug!(key = %key, holder = %source, "sending fragment");
            self.send(source, message);
            return Ok(());
        }

        let restored = job.restored;
        self.handoffs.remove(&key);
        let now = self.clock.now();
        if restored {
            tracing::info!(key = %key, holder = %source, "restored fragment already placed");
        } else {
            tracing::info!(key = %key, holder = %source, "destination already holds fragment, discarding local copy");
            self.directory.mark_local_dead(&key);
            self.fragments.delete(&key).await?;
        }
        let news = self
            .directory
            .add_fragment_news(&key, source, EventKind::Acquired, None, now);
        self.escalate(news)?;
        self.dirty = true;
        Ok(())
    }

    pub(super) async fn on_handoff_receipt(&mut self, source: NodeId, key: FragmentKey) -> Result<()> {
        let Some(job) = self.handoffs.remove(&key) else {
            return Ok(());
        };
        let now = self.clock.now();

        if !job.restored {
            self.directory.forget_local(&key);
        }
        let news = self
            .directory
            .add_fragment_news(&key, source, EventKind::Acquired, None, now);
        self.escalate(news)?;
        self.directory.record_migrated(&key, source);
        if job.restored {
            tracing::info!(key = %key, holder = %source, "restored fragment placed");
        } else {
            self.fragments.delete(&key).await?;
            tracing::info!(key = %key, holder = %source, "fragment handed off");
        }
        self.dirty = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::HandoffJob;
    use crate::directory::EventKind;
    use crate::engine::testing::*;
    use crate::engine::{Event, TimerKind};
    use crate::erasure::ReedSolomonCodec;
    use crate::id::Id;
    use crate::manifest::StoredObject;
    use crate::placement::locate;
    use crate::protocol::{Envelope, Message};
    use crate::substrate::mock::{MemoryPrimaryStore, SimNetwork};
    use crate::substrate::ManualClock;

    /// A node holding fragment 2 far away from that fragment's placement
    /// point, with a neighbour sitting right on it.
    async fn misplaced_holder() -> (SimNetwork, TestNode, Id, StoredObject) {
        let net = SimNetwork::new(8);
        let primary = MemoryPrimaryStore::new();
        let clock = ManualClock::new(START);
        let object = StoredObject::immutable(b"migrating".to_vec());
        let target = locate(&object.key, 2, 7);
        let local = Id::from_prefix(target.prefix().wrapping_add(1 << 40));
        let neighbour = Id::from_prefix(target.prefix().wrapping_add(1));

        let mut t = node_on(&net, local, &primary, &clock);
        let _n = net.join(neighbour);

        let codec = ReedSolomonCodec::new(7, 3).unwrap();
        let (manifest, fragments) = object.encode(&codec).unwrap();
        let insert = Envelope::new(
            1,
            Id::from_prefix(5),
            local,
            Message::Insert {
                key: object.version_key().fragment(2),
                manifest,
                fragment: fragments[2].clone(),
                known_holders: Vec::new(),
            },
        );
        t.node.handle(Event::Deliver(insert)).await.unwrap();
        net.discard();
        (net, t, neighbour, object)
    }

    #[tokio::test]
    async fn test_closer_neighbour_gets_fragment() {
        let (net, mut t, neighbour, object) = misplaced_holder().await;
        let key = object.version_key().fragment(2);
        let local = t.node.local_id();

        t.node.begin_handoffs().await.unwrap();
        assert!(t.node.timer_armed(TimerKind::Handoff));
        let query = net.pop().unwrap();
        assert_eq!(query.to, neighbour);
        assert_eq!(query.envelope.message, Message::Query { key });

        let no = Envelope::new(7, neighbour, local, Message::Response { key, have_it: false });
        t.node.handle(Event::Deliver(no)).await.unwrap();
        let insert = net.pop().unwrap();
        assert!(matches!(insert.envelope.message, Message::Insert { .. }));

        let receipt = Envelope::new(8, neighbour, local, Message::Receipt { key });
        t.node.handle(Event::Deliver(receipt)).await.unwrap();

        assert!(t.fragments.is_empty());
        let file = t.node.directory().file(&object.version_key()).unwrap();
        assert!(!file.has_fragment(2));
        assert!(file.find_remote(2, &neighbour).is_some());
        let last = t.node.directory().history().iter().last().unwrap();
        assert_eq!((last.kind, last.holder), (EventKind::HandedOff, neighbour));
    }

    #[tokio::test]
    async fn test_collision_discards_local_copy() {
        let (net, mut t, neighbour, object) = misplaced_holder().await;
        let key = object.version_key().fragment(2);
        let local = t.node.local_id();

        t.node.begin_handoffs().await.unwrap();
        net.discard();
        let yes = Envelope::new(7, neighbour, local, Message::Response { key, have_it: true });
        t.node.handle(Event::Deliver(yes)).await.unwrap();

        assert!(t.fragments.is_empty());
        assert_eq!(t.node.handoff_jobs().count(), 0);
        assert_eq!(net.pending(), 0, "no insert after a collision");
        let file = t.node.directory().file(&object.version_key()).unwrap();
        assert!(file.find_remote(2, &neighbour).is_some());
    }

    #[tokio::test]
    async fn test_unconfirmed_handoff_dropped_at_cycle_end() {
        let (net, mut t, _, _) = misplaced_holder().await;
        t.node.begin_handoffs().await.unwrap();
        net.discard();
        assert_eq!(t.node.handoff_jobs().count(), 1);

        t.node.handle(Event::Timer(TimerKind::Handoff)).await.unwrap();
        assert_eq!(t.node.handoff_jobs().count(), 0);
        assert_eq!(t.fragments.len(), 1, "local copy kept");
        assert!(t.node.timer_armed(TimerKind::StatusCast));
    }

    #[tokio::test]
    async fn test_restored_fragment_kept_until_placed() {
        let (net, mut t, neighbour, object) = misplaced_holder().await;
        let key = object.version_key().fragment(3);
        let local = t.node.local_id();
        let codec = ReedSolomonCodec::new(7, 3).unwrap();
        let (manifest, fragments) = object.encode(&codec).unwrap();
        let destination = locate(&object.key, 3, 7);
        t.node.handoffs.insert(
            key,
            HandoffJob::restored(key, destination, fragments[3].clone(), manifest),
        );

        t.node.handle(Event::Timer(TimerKind::Handoff)).await.unwrap();
        net.discard();
        let pending: Vec<_> = t.node.handoff_jobs().map(HandoffJob::key).collect();
        assert_eq!(pending, vec![key]);

        let receipt = Envelope::new(8, neighbour, local, Message::Receipt { key });
        t.node.handle(Event::Deliver(receipt)).await.unwrap();

        assert_eq!(t.node.handoff_jobs().count(), 0);
        assert_eq!(t.fragments.len(), 1, "only the local fragment 2 is stored");
        let file = t.node.directory().file(&object.version_key()).unwrap();
        assert!(file.find_remote(3, &neighbour).is_some());
        let last = t.node.directory().history().iter().last().unwrap();
        assert_eq!((last.kind, last.key, last.holder), (EventKind::HandedOff, key, neighbour));
    }
}
