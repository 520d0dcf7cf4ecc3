//! Shared fixtures for the multi-node scenario tests.
//!
//! A [`Cluster`] is a set of Glacier nodes on one [`SimNetwork`] ring,
//! sharing a primary store and a manually advanced clock. Tests drive it
//! explicitly: timers are fired by hand and queued messages are delivered
//! with [`Cluster::deliver_all`].

#![allow(dead_code)]

use glacier::engine::{Collaborators, Event, Glacier, TimerKind};
use glacier::erasure::ReedSolomonCodec;
use glacier::substrate::mock::{MemoryFragmentStore, MemoryPrimaryStore, SimNetwork};
use glacier::substrate::ManualClock;
use glacier::{GlacierConfig, Id, NodeId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const START: u64 = 1_700_000_000_000;

pub struct Node {
    pub glacier: Glacier,
    pub fragments: MemoryFragmentStore,
    pub mailbox: mpsc::UnboundedReceiver<Event>,
}

pub struct Cluster {
    pub net: SimNetwork,
    pub primary: MemoryPrimaryStore,
    pub clock: ManualClock,
    pub nodes: BTreeMap<NodeId, Node>,
}

/// Node ids spread evenly around the ring.
pub fn spread_ids(count: u64) -> Vec<NodeId> {
    let step = u64::MAX / count;
    (0..count).map(|i| Id::from_prefix(i * step)).collect()
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            net: SimNetwork::new(16),
            primary: MemoryPrimaryStore::new(),
            clock: ManualClock::new(START),
            nodes: BTreeMap::new(),
        }
    }

    /// A cluster of `count` evenly spread nodes with default settings.
    pub fn spread(count: u64) -> Self {
        let mut cluster = Self::new();
        for id in spread_ids(count) {
            cluster.add_node(id, GlacierConfig::default());
        }
        cluster
    }

    pub fn add_node(&mut self, id: NodeId, config: GlacierConfig) {
        let node = self.build_node(id, config).expect("node starts");
        self.nodes.insert(id, node);
    }

    pub fn build_node(&self, id: NodeId, config: GlacierConfig) -> glacier::Result<Node> {
        let fragments = MemoryFragmentStore::new();
        let codec = ReedSolomonCodec::new(
            config.protocol.num_fragments,
            config.protocol.num_survivors,
        )
        .expect("valid codec");
        let collaborators = Collaborators {
            overlay: Arc::new(self.net.join(id)),
            primary: Arc::new(self.primary.clone()),
            fragments: Arc::new(fragments.clone()),
            codec: Arc::new(codec),
            clock: Arc::new(self.clock.clone()),
        };
        let (glacier, mailbox) = Glacier::new(config, collaborators)?;
        Ok(Node {
            glacier: glacier.with_seed(id.prefix()),
            fragments,
            mailbox,
        })
    }

    pub fn node(&self, id: &NodeId) -> &Node {
        self.nodes.get(id).expect("known node")
    }

    pub fn node_mut(&mut self, id: &NodeId) -> &mut Node {
        self.nodes.get_mut(id).expect("known node")
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Deliver queued messages until the ring is quiet. Messages routed to
    /// a node that died in the meantime are lost.
    pub async fn deliver_all(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(delivery) = self.net.pop() {
            if !self.net.is_alive(&delivery.to) {
                continue;
            }
            if let Some(node) = self.nodes.get_mut(&delivery.to) {
                node.glacier
                    .handle(Event::Deliver(delivery.envelope))
                    .await
                    .expect("no fatal error");
                delivered += 1;
            }
            assert!(delivered < 100_000, "message storm");
        }
        delivered
    }

    pub async fn fire(&mut self, id: &NodeId, kind: TimerKind) {
        self.node_mut(id)
            .glacier
            .handle(Event::Timer(kind))
            .await
            .expect("no fatal error");
    }

    /// Handle the next event a spawned task posts to `id`'s mailbox.
    pub async fn handle_posted(&mut self, id: &NodeId) {
        let node = self.node_mut(id);
        let event = tokio::time::timeout(Duration::from_secs(5), node.mailbox.recv())
            .await
            .expect("event posted in time")
            .expect("mailbox open");
        node.glacier.handle(event).await.expect("no fatal error");
    }

    /// Take a node off the ring.
    pub fn kill(&mut self, id: &NodeId) {
        self.net.set_alive(id, false);
    }

    /// Live nodes whose fragment store holds fragment `index` of `key`.
    pub fn holders_of(&self, key: &glacier::VersionKey, index: usize) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(id, _)| self.net.is_alive(id))
            .filter(|(_, node)| node.fragments.keys().contains(&key.fragment(index)))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Insert `object` from `inserter` and run the exchange to completion.
    pub async fn insert(
        &mut self,
        inserter: &NodeId,
        object: glacier::StoredObject,
    ) -> glacier::InsertOutcome {
        let mut reply = self
            .node_mut(inserter)
            .glacier
            .insert(object, None)
            .expect("insert accepted");
        self.deliver_all().await;
        reply.try_recv().expect("insert finished")
    }

    /// Holder of each initially placed fragment, by fragment index.
    pub fn placed_holders(&self, key: &glacier::VersionKey, count: usize) -> Vec<NodeId> {
        (0..count)
            .map(|index| {
                let holders = self.holders_of(key, index);
                assert_eq!(holders.len(), 1, "fragment {index} placed once");
                holders[0]
            })
            .collect()
    }

    /// Let spawned primary-store tasks finish.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
