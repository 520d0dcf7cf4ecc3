//! The Glacier node: a single-owner actor driving every protocol phase.
//!
//! All directory, registry and job-table state is owned by [`Glacier`] and
//! mutated only from [`Glacier::handle`], one [`Event`] at a time. Network
//! messages, timer expiries, caller requests and completions of spawned
//! primary-store probes all arrive through the same mailbox, so no two
//! protocol steps ever interleave on shared state.
//!
//! ## Phases
//!
//! - **insert**: place the initial fragments of a new object
//! - **gossip**: status-casts, sticky relay for unreachable holders
//! - **audit**: probe primary replicas, expire stale holder entries
//! - **restore**: recover lost objects and fragments
//! - **handoff**: migrate fragments to better-placed neighbours
//! - **scheduler**: the periodic cycle chaining the phases above
//!
//! ## References
//!
//! - Wire format: [`crate::protocol`]
//! - Directory semantics: [`crate::directory`]

mod audit;
mod dispatch;
mod gossip;
mod handoff;
mod insert;
mod restore;
mod scheduler;

pub use handoff::HandoffJob;
pub use insert::{InsertJob, InsertOutcome};
pub use restore::{RestoreJob, RestoreStats, RestoreStatus, RestoreTarget};
pub use scheduler::TimerKind;

use crate::config::GlacierConfig;
use crate::directory::{DirectoryError, HolderDirectory};
use crate::erasure::ErasureCodec;
use crate::error::{GlacierError, Result};
use crate::id::{FragmentKey, Id, NodeId, VersionKey};
use crate::manifest::{Manifest, StoredObject};
use crate::persistence::{load_snapshot, save_snapshot, write_dump};
use crate::protocol::{Envelope, Message, StickyQueue};
use crate::substrate::{Clock, FragmentStore, Overlay, PrimaryStore};
use rand::rngs::StdRng;
use rand::SeedableRng;
use scheduler::Timers;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Everything the node reacts to.
#[derive(Debug)]
pub enum Event {
    /// A wire message arrived.
    Deliver(Envelope),
    Timer(TimerKind),
    /// Store a new object.
    Insert {
        object: StoredObject,
        manifest: Option<Manifest>,
        reply: oneshot::Sender<InsertOutcome>,
    },
    /// Completion of a primary-replica probe.
    AuditReply { key: VersionKey, found: bool },
    /// A node joined or left the local leaf set.
    LeafSetChanged { node: NodeId, joined: bool },
    /// Restart gossip after a global crash.
    Refreeze,
    Shutdown,
}

/// External services a node is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub overlay: Arc<dyn Overlay>,
    pub primary: Arc<dyn PrimaryStore>,
    pub fragments: Arc<dyn FragmentStore>,
    pub codec: Arc<dyn ErasureCodec>,
    pub clock: Arc<dyn Clock>,
}

/// Cloneable sender side of a node's mailbox.
#[derive(Clone, Debug)]
pub struct GlacierHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl GlacierHandle {
    fn post(&self, event: Event) -> Result<()> {
        self.tx.send(event).map_err(|_| GlacierError::MailboxClosed)
    }

    /// Insert an object; the receiver resolves once the insert finished.
    pub fn insert(&self, object: StoredObject) -> Result<oneshot::Receiver<InsertOutcome>> {
        let (reply, rx) = oneshot::channel();
        self.post(Event::Insert {
            object,
            manifest: None,
            reply,
        })?;
        Ok(rx)
    }

    pub fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.post(Event::Deliver(envelope))
    }

    pub fn leaf_set_changed(&self, node: NodeId, joined: bool) -> Result<()> {
        self.post(Event::LeafSetChanged { node, joined })
    }

    pub fn refreeze(&self) -> Result<()> {
        self.post(Event::Refreeze)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.post(Event::Shutdown)
    }
}

pub struct Glacier {
    config: GlacierConfig,
    overlay: Arc<dyn Overlay>,
    primary: Arc<dyn PrimaryStore>,
    fragments: Arc<dyn FragmentStore>,
    codec: Arc<dyn ErasureCodec>,
    clock: Arc<dyn Clock>,

    directory: HolderDirectory,
    inserts: BTreeMap<VersionKey, InsertJob>,
    restores: BTreeMap<VersionKey, RestoreJob>,
    handoffs: BTreeMap<FragmentKey, HandoffJob>,
    audits: BTreeSet<VersionKey>,
    sticky: StickyQueue,
    restore_stats: RestoreStats,

    timers: Timers,
    mailbox: mpsc::UnboundedSender<Event>,
    rng: StdRng,
    next_uid: u64,
    dirty: bool,
}

impl Glacier {
    /// Build a node, restoring its directory from the configured snapshot
    /// if one exists. Returns the node and its mailbox receiver.
    pub fn new(
        config: GlacierConfig,
        collaborators: Collaborators,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Event>)> {
        config.validate()?;
        if collaborators.codec.num_fragments() != config.protocol.num_fragments
            || collaborators.codec.num_survivors() != config.protocol.num_survivors
        {
            return Err(crate::config::ConfigError::Invalid(format!(
                "codec is {}-of-{}, configuration expects {}-of-{}",
                collaborators.codec.num_survivors(),
                collaborators.codec.num_fragments(),
                config.protocol.num_survivors,
                config.protocol.num_fragments
            ))
            .into());
        }

        let local_id = collaborators.overlay.local_id();
        let directory = match &config.storage.snapshot_path {
            Some(path) => match load_snapshot(path)? {
                Some(dir) if dir.local_id() == local_id => {
                    tracing::info!(
                        objects = dir.len(),
                        holders = dir.registry().len(),
                        seq = dir.current_seq(),
                        "directory restored from snapshot"
                    );
                    dir
                }
                Some(dir) => {
                    tracing::warn!(
                        snapshot_owner = %dir.local_id(),
                        local = %local_id,
                        "snapshot belongs to another node, starting empty"
                    );
                    HolderDirectory::new(local_id, config.protocol.num_fragments)
                }
                None => HolderDirectory::new(local_id, config.protocol.num_fragments),
            },
            None => HolderDirectory::new(local_id, config.protocol.num_fragments),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let node = Self {
            config,
            overlay: collaborators.overlay,
            primary: collaborators.primary,
            fragments: collaborators.fragments,
            codec: collaborators.codec,
            clock: collaborators.clock,
            directory,
            inserts: BTreeMap::new(),
            restores: BTreeMap::new(),
            handoffs: BTreeMap::new(),
            audits: BTreeSet::new(),
            sticky: StickyQueue::new(),
            restore_stats: RestoreStats::default(),
            timers: Timers::default(),
            mailbox: tx,
            rng: StdRng::from_entropy(),
            next_uid: 0,
            dirty: false,
        };
        Ok((node, rx))
    }

    /// Use a fixed random seed (deterministic sampling in tests).
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn handle_ref(&self) -> GlacierHandle {
        GlacierHandle {
            tx: self.mailbox.clone(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.directory.local_id()
    }

    pub fn config(&self) -> &GlacierConfig {
        &self.config
    }

    pub fn directory(&self) -> &HolderDirectory {
        &self.directory
    }

    pub fn insert_job(&self, key: &VersionKey) -> Option<&InsertJob> {
        self.inserts.get(key)
    }

    pub fn pending_inserts(&self) -> usize {
        self.inserts.len()
    }

    pub fn restore_job(&self, key: &VersionKey) -> Option<&RestoreJob> {
        self.restores.get(key)
    }

    pub fn restore_jobs(&self) -> impl Iterator<Item = &RestoreJob> {
        self.restores.values()
    }

    pub fn restore_stats(&self) -> RestoreStats {
        self.restore_stats
    }

    pub fn handoff_jobs(&self) -> impl Iterator<Item = &HandoffJob> {
        self.handoffs.values()
    }

    pub fn pending_audits(&self) -> &BTreeSet<VersionKey> {
        &self.audits
    }

    pub fn sticky_queue(&self) -> &StickyQueue {
        &self.sticky
    }

    pub fn timer_armed(&self, kind: TimerKind) -> bool {
        self.timers.is_armed(kind)
    }

    /// Process one event. Only fatal errors are returned; everything else
    /// is logged and dropped here.
    pub async fn handle(&mut self, event: Event) -> Result<()> {
        let result = match event {
            Event::Deliver(envelope) => self.deliver(envelope).await,
            Event::Timer(kind) => self.on_timer(kind).await,
            Event::Insert {
                object,
                manifest,
                reply,
            } => self.begin_insert(object, manifest, reply),
            Event::AuditReply { key, found } => {
                self.on_audit_reply(key, found);
                Ok(())
            }
            Event::LeafSetChanged { node, joined } => {
                self.on_leaf_set_change(node, joined);
                Ok(())
            }
            Event::Refreeze => {
                self.refreeze();
                Ok(())
            }
            Event::Shutdown => self.persist(),
        };
        match result {
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "fatal invariant violation");
                self.timers.cancel_all();
                Err(e)
            }
            Err(e) => {
                tracing::warn!(error = %e, "event dropped");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Drive the node until `Shutdown` or a fatal error.
    pub async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Event>) -> Result<()> {
        self.start();
        while let Some(event) = mailbox.recv().await {
            if matches!(event, Event::Shutdown) {
                break;
            }
            self.handle(event).await?;
        }
        self.timers.cancel_all();
        tracing::info!(local = %self.local_id(), "glacier stopping");
        self.persist()
    }

    /// Arm the periodic cycle.
    pub fn start(&mut self) {
        tracing::info!(
            local = %self.local_id(),
            fragments = self.config.protocol.num_fragments,
            survivors = self.config.protocol.num_survivors,
            "glacier starting"
        );
        self.schedule_next_status_cast();
    }

    /// Restart gossip after a global crash.
    pub fn refreeze(&mut self) {
        tracing::warn!("refreezing directory");
        let now = self.clock.now();
        self.directory.refreeze(now);
        self.dirty = true;
    }

    /// Insert an object; the receiver resolves once the insert finished.
    pub fn insert(
        &mut self,
        object: StoredObject,
        manifest: Option<Manifest>,
    ) -> Result<oneshot::Receiver<InsertOutcome>> {
        let (reply, rx) = oneshot::channel();
        self.begin_insert(object, manifest, reply)?;
        Ok(rx)
    }

    fn uid(&mut self) -> u64 {
        self.next_uid += 1;
        self.next_uid
    }

    /// Route `message` toward `target`. Routing failures are transient.
    fn send(&mut self, target: Id, message: Message) {
        let kind = message.kind();
        let envelope = Envelope::new(self.uid(), self.local_id(), target, message);
        if let Err(e) = self.overlay.route(target, envelope) {
            tracing::debug!(target = %target, kind, error = %e, "send failed");
        }
    }

    /// Log recoverable directory errors, pass fatal ones on.
    fn escalate(&self, result: std::result::Result<(), DirectoryError>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e @ DirectoryError::CapacityExceeded { .. }) => Err(e.into()),
            Err(e) => {
                tracing::warn!(error = %e, "directory update rejected");
                Ok(())
            }
        }
    }

    /// Write the snapshot and dump if anything changed since the last one.
    fn persist(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(path) = &self.config.storage.snapshot_path {
            save_snapshot(path, &self.directory)?;
            tracing::debug!(path = %path.display(), "snapshot written");
        }
        if let Some(path) = &self.config.storage.dump_path {
            if let Err(e) = write_dump(path, &self.directory) {
                tracing::warn!(path = %path.display(), error = %e, "directory dump failed");
            }
        }
        self.dirty = false;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::erasure::ReedSolomonCodec;
    use crate::substrate::mock::{MemoryFragmentStore, MemoryPrimaryStore, SimNetwork};
    use crate::substrate::ManualClock;

    #[tokio::test]
    async fn test_codec_must_match_config() {
        let net = SimNetwork::new(8);
        let collaborators = Collaborators {
            overlay: Arc::new(net.join(Id::from_prefix(1))),
            primary: Arc::new(MemoryPrimaryStore::new()),
            fragments: Arc::new(MemoryFragmentStore::new()),
            codec: Arc::new(ReedSolomonCodec::new(5, 2).unwrap()),
            clock: Arc::new(ManualClock::new(START)),
        };
        let result = Glacier::new(GlacierConfig::default(), collaborators);
        assert!(matches!(result, Err(GlacierError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_arms_status_cast() {
        let net = SimNetwork::new(8);
        let primary = MemoryPrimaryStore::new();
        let clock = ManualClock::new(START);
        let mut t = node_on(&net, Id::from_prefix(1), &primary, &clock);
        t.node.start();
        assert!(t.node.timer_armed(TimerKind::StatusCast));
        assert!(!t.node.timer_armed(TimerKind::Audit));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let net = SimNetwork::new(8);
        let primary = MemoryPrimaryStore::new();
        let clock = ManualClock::new(START);
        let t = node_on(&net, Id::from_prefix(1), &primary, &clock);
        let handle = t.node.handle_ref();
        handle.shutdown().unwrap();
        t.node.run(t.mailbox).await.unwrap();
    }
}
