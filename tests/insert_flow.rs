//! Insert Flow Integration Tests
//!
//! Places a new object on an eight-node ring and follows the
//! query / response / insert / receipt exchange to completion.
//!
//! ## Test Strategy
//!
//! - a clean insert places the 2k initial fragments on the
//!   nodes closest to their placement points
//! - every holder learns where the other fragments went
//! - a query lost to a dying node is re-sent on timeout and
//!   answered by the next closest node
//! - repeating a pending insert is refused
//! - mutable objects only reach the primary store

mod common;

use common::{spread_ids, Cluster};
use glacier::engine::{Event, TimerKind};
use glacier::placement::locate;
use glacier::{InsertOutcome, StoredObject};
use std::time::Duration;

// === Test Fixtures ===

const INITIAL_FRAGMENTS: usize = 6;

fn object(payload: &[u8]) -> StoredObject {
    StoredObject::immutable(payload.to_vec())
}

// === Tests ===

#[tokio::test]
async fn test_insert_places_initial_fragments() {
    let mut cluster = Cluster::spread(8);
    let inserter = cluster.ids()[0];
    let object = object(b"scenario one: a clean insert");
    let vk = object.version_key();

    let outcome = cluster.insert(&inserter, object.clone()).await;
    assert_eq!(outcome, InsertOutcome::Stored);
    assert_eq!(cluster.node(&inserter).glacier.pending_inserts(), 0);
    assert!(!cluster.node(&inserter).glacier.timer_armed(TimerKind::InsertRetry));

    let holders = cluster.placed_holders(&vk, INITIAL_FRAGMENTS);
    for (index, holder) in holders.iter().enumerate() {
        let point = locate(&vk.key, index, 7);
        assert_eq!(Some(*holder), cluster.net.closest_live(&point));
    }
    assert!(cluster.holders_of(&vk, 6).is_empty(), "only 2k fragments are placed");

    cluster.settle().await;
    assert!(cluster.primary.contains(&vk.key));
}

#[tokio::test]
async fn test_holders_learn_each_other() {
    let mut cluster = Cluster::spread(8);
    let inserter = cluster.ids()[3];
    let object = object(b"scenario two: shared knowledge");
    let vk = object.version_key();

    assert_eq!(cluster.insert(&inserter, object).await, InsertOutcome::Stored);

    let holders = cluster.placed_holders(&vk, INITIAL_FRAGMENTS);
    for (index, holder) in holders.iter().enumerate() {
        let directory = cluster.node(holder).glacier.directory();
        let file = directory.file(&vk).expect("holder tracks the object");
        assert!(file.has_fragment(index));
        assert_eq!(file.live_fragment_count(), INITIAL_FRAGMENTS);
        for (other_index, other) in holders.iter().enumerate() {
            if other != holder {
                assert!(file.find_remote(other_index, other).is_some());
            }
        }
    }
}

#[tokio::test]
async fn test_lost_query_retried_elsewhere() {
    let mut cluster = Cluster::spread(8);
    let object = object(b"scenario three: a holder dies mid-insert");
    let vk = object.version_key();

    // the node responsible for fragment 4 dies with its query in flight
    let doomed = cluster
        .net
        .closest_live(&locate(&vk.key, 4, 7))
        .expect("ring not empty");
    let inserter = cluster
        .ids()
        .into_iter()
        .find(|id| *id != doomed)
        .expect("other nodes");
    let mut reply = cluster
        .node_mut(&inserter)
        .glacier
        .insert(object, None)
        .expect("insert accepted");
    cluster.kill(&doomed);
    cluster.deliver_all().await;

    let job = cluster.node(&inserter).glacier.insert_job(&vk).expect("still pending");
    assert_eq!(job.holders_known(), INITIAL_FRAGMENTS - 1);
    assert!(!job.inserts_sent());

    cluster.clock.advance(Duration::from_secs(31));
    cluster.fire(&inserter, TimerKind::InsertRetry).await;
    cluster.deliver_all().await;

    assert_eq!(reply.try_recv().expect("insert finished"), InsertOutcome::Stored);
    let replacement = cluster.holders_of(&vk, 4);
    assert_eq!(replacement.len(), 1);
    assert_ne!(replacement[0], doomed);
}

#[tokio::test]
async fn test_duplicate_insert_refused() {
    let mut cluster = Cluster::spread(4);
    let inserter = spread_ids(4)[1];
    let object = object(b"scenario four: twice");

    let node = cluster.node_mut(&inserter);
    let _first = node.glacier.insert(object.clone(), None).unwrap();
    let mut second = node.glacier.insert(object, None).unwrap();
    assert_eq!(second.try_recv().unwrap(), InsertOutcome::AlreadyPending);
    assert_eq!(node.glacier.pending_inserts(), 1);
}

#[tokio::test]
async fn test_mutable_object_primary_only() {
    let mut cluster = Cluster::spread(4);
    let inserter = spread_ids(4)[2];
    let object = StoredObject::mutable(glacier::Id::for_content(b"log head"), 4, b"v4".to_vec());

    let (reply, rx) = tokio::sync::oneshot::channel();
    cluster
        .node_mut(&inserter)
        .glacier
        .handle(Event::Insert {
            object: object.clone(),
            manifest: None,
            reply,
        })
        .await
        .unwrap();

    assert_eq!(rx.await.unwrap(), InsertOutcome::Stored);
    assert!(cluster.primary.contains(&object.key));
    assert_eq!(cluster.net.pending(), 0, "no fragments for mutable objects");
}
