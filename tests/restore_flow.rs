//! Restore Flow Integration Tests
//!
//! Objects are inserted on an eight-node ring, then holders die and the
//! primary replica is lost. A surviving holder runs its maintenance cycle
//! (audit, expiry, restore) by hand.
//!
//! ## Test Strategy
//!
//! - two live fragments out of a 3-of-7 code cannot rebuild
//!   the object, the job is dropped without reinserting anything
//! - three live fragments are collected, decoded and the object
//!   goes back to the primary store
//! - a fragment with no live holder is regenerated from the
//!   primary replica and placed at its placement point
//! - holders that never answer exhaust the candidates

mod common;

use common::Cluster;
use glacier::engine::{RestoreStatus, RestoreTarget, TimerKind};
use glacier::placement::locate;
use glacier::protocol::Message;
use glacier::{InsertOutcome, NodeId, StoredObject, VersionKey};
use std::time::Duration;

// === Test Fixtures ===

const INITIAL_FRAGMENTS: usize = 6;

/// Silence long enough for every unrefreshed holder entry to expire.
const OUTAGE: Duration = Duration::from_secs(43 * 60);

async fn placed_object(cluster: &mut Cluster, payload: &[u8]) -> (StoredObject, Vec<NodeId>) {
    let inserter = cluster.ids()[0];
    let object = StoredObject::immutable(payload.to_vec());
    assert_eq!(
        cluster.insert(&inserter, object.clone()).await,
        InsertOutcome::Stored
    );
    cluster.settle().await;
    let holders = cluster.placed_holders(&object.version_key(), INITIAL_FRAGMENTS);
    (object, holders)
}

/// Kill every holder but `survivors`, let time pass, then have the
/// survivors gossip so they are the only holders still heard from.
async fn outage(cluster: &mut Cluster, holders: &[NodeId], survivors: usize) {
    for dead in &holders[survivors..] {
        cluster.kill(dead);
    }
    cluster.clock.advance(OUTAGE);
    for alive in &holders[..survivors] {
        cluster.fire(alive, TimerKind::Handoff).await;
    }
    cluster.deliver_all().await;
}

/// Audit, then close the audit window (expiry and the first restore step).
async fn audit_cycle(cluster: &mut Cluster, id: &NodeId) {
    cluster.fire(id, TimerKind::StatusCast).await;
    cluster.handle_posted(id).await;
    cluster.fire(id, TimerKind::Audit).await;
}

async fn restore_round(cluster: &mut Cluster, id: &NodeId) {
    cluster.fire(id, TimerKind::Restore).await;
    cluster.deliver_all().await;
}

fn live_fragments(cluster: &Cluster, id: &NodeId, vk: &VersionKey) -> usize {
    cluster
        .node(id)
        .glacier
        .directory()
        .file(vk)
        .map_or(0, |file| file.live_fragment_count())
}

// === Tests ===

#[tokio::test]
async fn test_too_few_fragments_is_unrecoverable() {
    let mut cluster = Cluster::spread(8);
    let (object, holders) = placed_object(&mut cluster, b"scenario six").await;
    let vk = object.version_key();
    let watcher = holders[0];

    cluster.primary.lose(&object.key);
    outage(&mut cluster, &holders, 2).await;
    assert_eq!(
        cluster.node(&watcher).glacier.directory().file(&vk).unwrap().live_fragment_count(),
        INITIAL_FRAGMENTS,
        "dead holders are only noticed on expiry"
    );

    audit_cycle(&mut cluster, &watcher).await;

    let node = &cluster.node(&watcher).glacier;
    assert_eq!(live_fragments(&cluster, &watcher, &vk), 2);
    assert!(node.restore_job(&vk).is_none());
    assert_eq!(node.restore_stats().unrecoverable, 1);
    assert_eq!(node.restore_stats().objects_recovered, 0);
    assert!(node.timer_armed(TimerKind::Handoff));
    let fetches = cluster
        .net
        .drain()
        .into_iter()
        .filter(|d| matches!(d.envelope.message, Message::Fetch { .. }))
        .count();
    assert_eq!(fetches, 0);

    cluster.settle().await;
    assert!(!cluster.primary.contains(&object.key));
}

#[tokio::test]
async fn test_object_rebuilt_from_three_fragments() {
    let mut cluster = Cluster::spread(8);
    let (object, holders) = placed_object(&mut cluster, b"scenario seven").await;
    let vk = object.version_key();
    let watcher = holders[0];

    cluster.primary.lose(&object.key);
    outage(&mut cluster, &holders, 3).await;
    audit_cycle(&mut cluster, &watcher).await;

    let job = cluster.node(&watcher).glacier.restore_job(&vk).expect("restore started");
    assert_eq!(job.target(), RestoreTarget::Object);
    assert_eq!(job.status(), RestoreStatus::CollectingFragments);
    assert_eq!(job.collected(), 1, "own fragment counts");
    assert_eq!(live_fragments(&cluster, &watcher, &vk), 3);

    restore_round(&mut cluster, &watcher).await;
    restore_round(&mut cluster, &watcher).await;
    let job = cluster.node(&watcher).glacier.restore_job(&vk).unwrap();
    assert_eq!(job.collected(), 3);
    assert_eq!(job.status(), RestoreStatus::Recoding);

    cluster.fire(&watcher, TimerKind::Restore).await;
    let node = &cluster.node(&watcher).glacier;
    assert!(node.restore_job(&vk).is_none());
    assert_eq!(node.restore_stats().objects_recovered, 1);

    cluster.settle().await;
    assert!(cluster.primary.contains(&object.key));
    assert_eq!(
        cluster.primary.inserted().iter().filter(|k| **k == object.key).count(),
        2,
        "original insert plus the reinsert"
    );
}

#[tokio::test]
async fn test_missing_fragment_regenerated_and_placed() {
    let mut cluster = Cluster::spread(8);
    let (object, holders) = placed_object(&mut cluster, b"scenario eight").await;
    let vk = object.version_key();
    let watcher = holders[0];

    outage(&mut cluster, &holders, 5).await;
    audit_cycle(&mut cluster, &watcher).await;
    assert!(cluster.node(&watcher).glacier.pending_audits().is_empty());

    let job = cluster.node(&watcher).glacier.restore_job(&vk).expect("restore started");
    let RestoreTarget::Fragment(index) = job.target() else {
        panic!("expected a fragment restore, got {:?}", job.target());
    };
    assert!(index == 5 || index == 6, "only fragments 5 and 6 lack a live holder");
    assert_eq!(job.status(), RestoreStatus::WaitingForPrimary);

    // the primary replica answers the fetch with a re-encoded fragment
    cluster.deliver_all().await;
    let node = &cluster.node(&watcher).glacier;
    assert!(node.restore_job(&vk).is_none());
    assert_eq!(node.restore_stats().fragments_regenerated, 1);
    let pending: Vec<_> = node.handoff_jobs().collect();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].is_restored());
    assert_eq!(pending[0].key(), vk.fragment(index));

    restore_round(&mut cluster, &watcher).await;

    assert_eq!(cluster.node(&watcher).glacier.handoff_jobs().count(), 0);
    let expected = cluster.net.closest_live(&locate(&vk.key, index, 7));
    assert_eq!(cluster.holders_of(&vk, index), expected.into_iter().collect::<Vec<_>>());
    let file = cluster.node(&watcher).glacier.directory().file(&vk).unwrap();
    assert!(file.slots(index).iter().any(|slot| slot.is_live()));
}

#[tokio::test]
async fn test_silent_holders_exhaust_candidates() {
    let mut cluster = Cluster::spread(8);
    let (object, holders) = placed_object(&mut cluster, b"scenario nine").await;
    let vk = object.version_key();
    let watcher = holders[0];

    cluster.primary.lose(&object.key);
    outage(&mut cluster, &holders, 3).await;
    // the third survivor still gossips but has lost its copy
    assert!(cluster.node(&holders[2]).fragments.corrupt_remove(&vk.fragment(2)));

    audit_cycle(&mut cluster, &watcher).await;
    restore_round(&mut cluster, &watcher).await;
    restore_round(&mut cluster, &watcher).await;
    let job = cluster.node(&watcher).glacier.restore_job(&vk).unwrap();
    assert_eq!(job.collected(), 2);
    assert_eq!(job.status(), RestoreStatus::CollectingFragments);

    restore_round(&mut cluster, &watcher).await;
    let node = &cluster.node(&watcher).glacier;
    assert!(node.restore_job(&vk).is_none());
    assert_eq!(node.restore_stats().abandoned, 1);
    assert_eq!(node.restore_stats().objects_recovered, 0);
}
