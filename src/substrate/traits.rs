//! Collaborator interfaces consumed by the Glacier engine.
//!
//! - **Overlay**: DHT routing and leaf-set membership
//! - **PrimaryStore**: the full-replica object store
//! - **FragmentStore**: local blob storage for fragments this node holds
//! - **Clock**: wall-clock source, swappable in tests

use crate::erasure::Fragment;
use crate::id::{FragmentKey, Id, NodeId, ObjectKey};
use crate::manifest::{Manifest, StoredObject};
use crate::protocol::Envelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Errors reported by substrate collaborators.
#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("Routing failed: {0}")]
    Routing(String),

    #[error("Primary store failure: {0}")]
    Primary(String),

    #[error("Fragment store failure: {0}")]
    FragmentStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fragment blob together with the manifest it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFragment {
    pub fragment: Fragment,
    pub manifest: Manifest,
}

/// DHT substrate.
///
/// `route` delivers to the live node numerically closest to `target`, which
/// may not be the node with id `target` if that node is unreachable.
pub trait Overlay: Send + Sync {
    fn local_id(&self) -> NodeId;

    /// Best-effort, unordered delivery.
    fn route(&self, target: Id, envelope: Envelope) -> Result<(), SubstrateError>;

    /// Current leaf-set neighbours, excluding the local node.
    fn leaf_set(&self) -> Vec<NodeId>;
}

/// The full-replica object store this overlay augments.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Nodes currently holding a replica of `key`, at most `max_count`.
    async fn lookup_handles(
        &self,
        key: &ObjectKey,
        max_count: usize,
    ) -> Result<Vec<NodeId>, SubstrateError>;

    async fn insert(&self, object: StoredObject) -> Result<(), SubstrateError>;

    /// Locally available full replica, if any.
    async fn get(&self, key: &ObjectKey) -> Result<Option<StoredObject>, SubstrateError>;
}

/// Local byte-blob storage for fragments.
#[async_trait]
pub trait FragmentStore: Send + Sync {
    async fn exists(&self, key: &FragmentKey) -> Result<bool, SubstrateError>;

    async fn get(&self, key: &FragmentKey) -> Result<Option<StoredFragment>, SubstrateError>;

    async fn put(&self, key: FragmentKey, value: StoredFragment) -> Result<(), SubstrateError>;

    async fn delete(&self, key: &FragmentKey) -> Result<(), SubstrateError>;
}

/// Wall-clock source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Clock backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: Timestamp) {
        self.now.store(to, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}
