//! In-memory substrate for tests and local simulation.
//!
//! [`SimNetwork`] is a toy ring: `route` delivers to the live node closest to
//! the target and every envelope is round-tripped through its CBOR wire
//! encoding. Delivery is driven by the caller (`pop` / `drain`), so tests
//! decide exactly when and in which order messages arrive.

use super::traits::*;
use crate::id::{FragmentKey, Id, NodeId, ObjectKey};
use crate::manifest::StoredObject;
use crate::protocol::Envelope;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A message in flight on the simulated ring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub to: NodeId,
    pub envelope: Envelope,
}

struct SimState {
    nodes: BTreeMap<NodeId, bool>,
    queue: VecDeque<(NodeId, Vec<u8>)>,
    leaf_set_size: usize,
}

/// Simulated DHT ring shared by every node of a test.
#[derive(Clone)]
pub struct SimNetwork {
    state: Arc<Mutex<SimState>>,
}

impl SimNetwork {
    /// `leaf_set_size` neighbours are reported per node (closest first).
    pub fn new(leaf_set_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                nodes: BTreeMap::new(),
                queue: VecDeque::new(),
                leaf_set_size,
            })),
        }
    }

    /// Join a node and return its overlay handle.
    pub fn join(&self, id: NodeId) -> SimOverlay {
        lock(&self.state).nodes.insert(id, true);
        SimOverlay {
            id,
            network: self.clone(),
        }
    }

    pub fn set_alive(&self, id: &NodeId, alive: bool) {
        if let Some(entry) = lock(&self.state).nodes.get_mut(id) {
            *entry = alive;
        }
    }

    pub fn is_alive(&self, id: &NodeId) -> bool {
        lock(&self.state).nodes.get(id).copied().unwrap_or(false)
    }

    /// Live node closest to `target`.
    pub fn closest_live(&self, target: &Id) -> Option<NodeId> {
        lock(&self.state)
            .nodes
            .iter()
            .filter(|(_, alive)| **alive)
            .map(|(id, _)| *id)
            .min_by_key(|id| id.distance(target))
    }

    /// Next undelivered message, decoded from the wire.
    pub fn pop(&self) -> Option<Delivery> {
        let (to, bytes) = lock(&self.state).queue.pop_front()?;
        match Envelope::from_bytes(&bytes) {
            Ok(envelope) => Some(Delivery { to, envelope }),
            Err(e) => {
                tracing::warn!(error = %e, "undecodable message dropped");
                self.pop()
            }
        }
    }

    /// Next undelivered message addressed to `to`; others stay queued.
    pub fn pop_for(&self, to: &NodeId) -> Option<Delivery> {
        let bytes = {
            let mut state = lock(&self.state);
            let pos = state.queue.iter().position(|(dest, _)| dest == to)?;
            state.queue.remove(pos)?.1
        };
        match Envelope::from_bytes(&bytes) {
            Ok(envelope) => Some(Delivery { to: *to, envelope }),
            Err(e) => {
                tracing::warn!(error = %e, "undecodable message dropped");
                self.pop_for(to)
            }
        }
    }

    /// Take every undelivered message.
    pub fn drain(&self) -> Vec<Delivery> {
        std::iter::from_fn(|| self.pop()).collect()
    }

    /// Drop every undelivered message.
    pub fn discard(&self) -> usize {
        let mut state = lock(&self.state);
        let n = state.queue.len();
        state.queue.clear();
        n
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).queue.len()
    }
}

/// One node's view of a [`SimNetwork`].
#[derive(Clone)]
pub struct SimOverlay {
    id: NodeId,
    network: SimNetwork,
}

impl Overlay for SimOverlay {
    fn local_id(&self) -> NodeId {
        self.id
    }

    fn route(&self, target: Id, envelope: Envelope) -> Result<(), SubstrateError> {
        let bytes = envelope
            .to_bytes()
            .map_err(|e| SubstrateError::Routing(e.to_string()))?;
        let to = self
            .network
            .closest_live(&target)
            .ok_or_else(|| SubstrateError::Routing("no live node on the ring".into()))?;
        lock(&self.network.state).queue.push_back((to, bytes));
        Ok(())
    }

    fn leaf_set(&self) -> Vec<NodeId> {
        let state = lock(&self.network.state);
        let mut others: Vec<NodeId> = state
            .nodes
            .iter()
            .filter(|(id, alive)| **alive && **id != self.id)
            .map(|(id, _)| *id)
            .collect();
        others.sort_by_key(|id| id.distance(&self.id));
        others.truncate(state.leaf_set_size);
        others
    }
}

/// Shared in-memory primary store.
#[derive(Clone, Default)]
pub struct MemoryPrimaryStore {
    objects: Arc<Mutex<HashMap<ObjectKey, StoredObject>>>,
    inserts: Arc<Mutex<Vec<ObjectKey>>>,
}

impl MemoryPrimaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate silent loss of every replica of `key`.
    pub fn lose(&self, key: &ObjectKey) -> Option<StoredObject> {
        lock(&self.objects).remove(key)
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        lock(&self.objects).contains_key(key)
    }

    /// Keys passed to `insert`, in call order.
    pub fn inserted(&self) -> Vec<ObjectKey> {
        lock(&self.inserts).clone()
    }
}

#[async_trait]
impl PrimaryStore for MemoryPrimaryStore {
    async fn lookup_handles(
        &self,
        key: &ObjectKey,
        max_count: usize,
    ) -> Result<Vec<NodeId>, SubstrateError> {
        let found = lock(&self.objects).contains_key(key);
        Ok(if found && max_count > 0 {
            vec![*key]
        } else {
            Vec::new()
        })
    }

    async fn insert(&self, object: StoredObject) -> Result<(), SubstrateError> {
        lock(&self.inserts).push(object.key);
        lock(&self.objects).insert(object.key, object);
        Ok(())
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<StoredObject>, SubstrateError> {
        Ok(lock(&self.objects).get(key).cloned())
    }
}

/// In-memory fragment store.
#[derive(Clone, Default)]
pub struct MemoryFragmentStore {
    fragments: Arc<Mutex<BTreeMap<FragmentKey, StoredFragment>>>,
}

impl MemoryFragmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<FragmentKey> {
        lock(&self.fragments).keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.fragments).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.fragments).is_empty()
    }

    /// Remove a blob behind the directory's back (disk loss).
    pub fn corrupt_remove(&self, key: &FragmentKey) -> bool {
        lock(&self.fragments).remove(key).is_some()
    }
}

#[async_trait]
impl FragmentStore for MemoryFragmentStore {
    async fn exists(&self, key: &FragmentKey) -> Result<bool, SubstrateError> {
        Ok(lock(&self.fragments).contains_key(key))
    }

    async fn get(&self, key: &FragmentKey) -> Result<Option<StoredFragment>, SubstrateError> {
        Ok(lock(&self.fragments).get(key).cloned())
    }

    async fn put(&self, key: FragmentKey, value: StoredFragment) -> Result<(), SubstrateError> {
        lock(&self.fragments).insert(key, value);
        Ok(())
    }

    async fn delete(&self, key: &FragmentKey) -> Result<(), SubstrateError> {
        lock(&self.fragments).remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    #[test]
    fn test_route_reaches_closest_live_node() {
        let net = SimNetwork::new(4);
        let a = net.join(Id::from_prefix(100));
        let _b = net.join(Id::from_prefix(200));
        let c = Id::from_prefix(300);
        net.join(c);

        let key = crate::id::VersionKey::new(Id::from_prefix(1), 0).fragment(0);
        let envelope = Envelope::new(1, a.local_id(), Id::from_prefix(290), Message::Query { key });
        a.route(Id::from_prefix(290), envelope.clone()).unwrap();
        assert_eq!(net.pop(), Some(Delivery { to: c, envelope: envelope.clone() }));

        net.set_alive(&c, false);
        a.route(Id::from_prefix(290), envelope).unwrap();
        assert_eq!(net.pop().unwrap().to, Id::from_prefix(200));
    }

    #[test]
    fn test_leaf_set_excludes_self_and_dead() {
        let net = SimNetwork::new(2);
        let a = net.join(Id::from_prefix(10));
        net.join(Id::from_prefix(20));
        net.join(Id::from_prefix(30));
        net.join(Id::from_prefix(1 << 60));
        net.set_alive(&Id::from_prefix(20), false);

        let leaf_set = a.leaf_set();
        assert_eq!(leaf_set, vec![Id::from_prefix(30), Id::from_prefix(1 << 60)]);
    }

    #[tokio::test]
    async fn test_primary_store_loss() {
        let store = MemoryPrimaryStore::new();
        let object = StoredObject::immutable(b"x".to_vec());
        store.insert(object.clone()).await.unwrap();
        assert_eq!(store.lookup_handles(&object.key, 1).await.unwrap().len(), 1);

        store.lose(&object.key);
        assert!(store.lookup_handles(&object.key, 1).await.unwrap().is_empty());
        assert_eq!(store.inserted(), vec![object.key]);
    }
}
