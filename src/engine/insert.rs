//! Initial placement of a new object's fragments.
//!
//! ```text
//! Query(i)   -> locate(key, i)        for each of the 2k initial fragments
//! Response   <- closest node          (holder now known)
//! Insert(i)  -> holder                once every holder is known
//! Receipt    <- holder                job done once all are in
//! ```
//!
//! A timeout before all holders are known re-sends the missing queries; a
//! timeout after the inserts went out re-sends the unconfirmed inserts.

use super::{Glacier, TimerKind};
use crate::erasure::Fragment;
use crate::error::{GlacierError, Result};
use crate::id::{FragmentKey, NodeId, VersionKey};
use crate::manifest::{Manifest, StoredObject};
use crate::placement::locate_fragment;
use crate::protocol::{KnownHolder, Message};
use crate::substrate::Timestamp;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// How an insert ended, reported to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored,
    Failed { reason: String },
    /// The same version is already being inserted.
    AlreadyPending,
}

#[derive(Clone, Copy, Debug, Default)]
struct Target {
    holder: Option<NodeId>,
    receipt: bool,
}

#[derive(Debug)]
pub struct InsertJob {
    version_key: VersionKey,
    fragments: Vec<Fragment>,
    manifest: Manifest,
    targets: Vec<Target>,
    deadline: Timestamp,
    attempts_left: u32,
    inserts_sent: bool,
    reply: Option<oneshot::Sender<InsertOutcome>>,
}

impl InsertJob {
    pub fn version_key(&self) -> VersionKey {
        self.version_key
    }

    pub fn holders_known(&self) -> usize {
        self.targets.iter().filter(|t| t.holder.is_some()).count()
    }

    pub fn receipts(&self) -> usize {
        self.targets.iter().filter(|t| t.receipt).count()
    }

    pub fn attempts_left(&self) -> u32 {
        self.attempts_left
    }

    pub fn inserts_sent(&self) -> bool {
        self.inserts_sent
    }

    fn all_holders_known(&self) -> bool {
        self.targets.iter().all(|t| t.holder.is_some())
    }

    fn all_receipts(&self) -> bool {
        self.targets.iter().all(|t| t.receipt)
    }

    fn finish(mut self, outcome: InsertOutcome) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(outcome);
        }
    }

    /// The other targets' holders, for seeding the receiver of fragment `index`.
    fn known_holders_for(&self, index: usize) -> Vec<KnownHolder> {
        self.targets
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .filter_map(|(i, t)| {
                t.holder.map(|holder| KnownHolder {
                    index: i,
                    holder,
                    certain: t.receipt,
                })
            })
            .collect()
    }
}

impl Glacier {
    pub(super) fn begin_insert(
        &mut self,
        object: StoredObject,
        manifest: Option<Manifest>,
        reply: oneshot::Sender<InsertOutcome>,
    ) -> Result<()> {
        let vk = object.version_key();
        let (computed, mut fragments) = match object.encode(self.codec.as_ref()) {
            Ok(encoded) => encoded,
            Err(e) => {
                let _ = reply.send(InsertOutcome::Failed {
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };
        if manifest.is_some_and(|supplied| supplied != computed) {
            let _ = reply.send(InsertOutcome::Failed {
                reason: "manifest does not match object".into(),
            });
            return Err(GlacierError::InvalidManifest(vk));
        }

        if object.mutable {
            tracing::debug!(key = %vk, "mutable object, primary store only");
            self.spawn_primary_insert(object, Some(reply));
            return Ok(());
        }

        if self.inserts.contains_key(&vk) {
            tracing::warn!(key = %vk, "insert already pending, ignored");
            let _ = reply.send(InsertOutcome::AlreadyPending);
            return Ok(());
        }

        self.spawn_primary_insert(object, None);

        let initial = self.config.protocol.num_initial_fragments();
        fragments.truncate(initial);
        let now = self.clock.now();
        let job = InsertJob {
            version_key: vk,
            fragments,
            manifest: computed,
            targets: vec![Target::default(); initial],
            deadline: now + self.config.timing.insert_timeout.as_millis() as u64,
            attempts_left: self.config.protocol.insert_attempts,
            inserts_sent: false,
            reply: Some(reply),
        };
        self.inserts.insert(vk, job);

        tracing::info!(key = %vk, fragments = initial, "inserting object");
        for index in 0..initial {
            self.send_insert_query(vk.fragment(index));
        }
        self.rearm_insert_timer();
        Ok(())
    }

    /// Store a full replica; the outcome goes to `reply` if given, else to
    /// the log.
    pub(super) fn spawn_primary_insert(
        &self,
        object: StoredObject,
        reply: Option<oneshot::Sender<InsertOutcome>>,
    ) {
        let primary = Arc::clone(&self.primary);
        tokio::spawn(async move {
            let key = object.version_key();
            let outcome = match primary.insert(object).await {
                Ok(()) => {
                    tracing::debug!(key = %key, "primary replica stored");
                    InsertOutcome::Stored
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "primary insert failed");
                    InsertOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            if let Some(reply) = reply {
                let _ = reply.send(outcome);
            }
        });
    }

    fn send_insert_query(&mut self, key: FragmentKey) {
        let target = locate_fragment(&key, self.directory.num_fragments());
        self.send(target, Message::Query { key });
    }

    fn send_inserts(&mut self, vk: VersionKey) {
        let Some(job) = self.inserts.get(&vk) else {
            return;
        };
        let outgoing: Vec<(NodeId, Message)> = job
            .targets
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.receipt)
            .filter_map(|(index, t)| {
                let holder = t.holder?;
                Some((
                    holder,
                    Message::Insert {
                        key: vk.fragment(index),
                        manifest: job.manifest.clone(),
                        fragment: job.fragments[index].clone(),
                        known_holders: job.known_holders_for(index),
                    },
                ))
            })
            .collect();
        for (holder, message) in outgoing {
            self.send(holder, message);
        }
    }

    pub(super) fn on_insert_response(
        &mut self,
        source: NodeId,
        key: FragmentKey,
        have_it: bool,
    ) -> Result<()> {
        let Some(job) = self.inserts.get_mut(&key.version_key) else {
            tracing::debug!(key = %key, source = %source, "response for no pending insert");
            return Ok(());
        };
        let Some(target) = job.targets.get_mut(key.index) else {
            tracing::warn!(key = %key, source = %source, "response for fragment outside insert set");
            return Ok(());
        };
        if target.holder.is_none() {
            target.holder = Some(source);
            target.receipt = have_it;
        }
        self.insert_step(key.version_key);
        Ok(())
    }

    pub(super) fn on_insert_receipt(&mut self, source: NodeId, key: FragmentKey) -> Result<()> {
        let Some(job) = self.inserts.get_mut(&key.version_key) else {
            tracing::debug!(key = %key, source = %source, "receipt for no pending insert");
            return Ok(());
        };
        let Some(target) = job.targets.get_mut(key.index) else {
            tracing::warn!(key = %key, source = %source, "receipt for fragment outside insert set");
            return Ok(());
        };
        if target.holder != Some(source) {
            tracing::debug!(key = %key, source = %source, "receipt from unexpected holder");
            target.holder = Some(source);
        }
        target.receipt = true;
        self.insert_step(key.version_key);
        Ok(())
    }

    fn insert_step(&mut self, vk: VersionKey) {
        let Some(job) = self.inserts.get_mut(&vk) else {
            return;
        };
        if job.all_receipts() {
            if let Some(job) = self.inserts.remove(&vk) {
                tracing::info!(key = %vk, "object inserted");
                job.finish(InsertOutcome::Stored);
            }
            self.rearm_insert_timer();
            return;
        }
        if job.all_holders_known() && !job.inserts_sent {
            job.inserts_sent = true;
            job.deadline =
                self.clock.now() + self.config.timing.insert_timeout.as_millis() as u64;
            tracing::debug!(key = %vk, "all holders known, sending fragments");
            self.send_inserts(vk);
            self.rearm_insert_timer();
        }
    }

    pub(super) fn on_insert_timeout(&mut self) -> Result<()> {
        let now = self.clock.now();
        let timeout = self.config.timing.insert_timeout.as_millis() as u64;
        let expired: Vec<VersionKey> = self
            .inserts
            .values()
            .filter(|job| job.deadline <= now)
            .map(|job| job.version_key)
            .collect();

        for vk in expired {
            let Some(job) = self.inserts.get_mut(&vk) else {
                continue;
            };
            job.attempts_left = job.attempts_left.saturating_sub(1);
            if job.attempts_left == 0 {
                tracing::warn!(
                    key = %vk,
                    holders = job.holders_known(),
                    receipts = job.receipts(),
                    "insert failed"
                );
                if let Some(job) = self.inserts.remove(&vk) {
                    job.finish(InsertOutcome::Failed {
                        reason: "no answer from fragment holders".into(),
                    });
                }
                continue;
            }

            job.deadline = now + timeout;
            if job.inserts_sent {
                tracing::debug!(key = %vk, "re-sending unconfirmed inserts");
                self.send_inserts(vk);
            } else {
                let missing: Vec<usize> = job
                    .targets
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.holder.is_none())
                    .map(|(i, _)| i)
                    .collect();
                tracing::debug!(key = %vk, missing = missing.len(), "re-sending queries");
                for index in missing {
                    self.send_insert_query(vk.fragment(index));
                }
            }
        }
        self.rearm_insert_timer();
        Ok(())
    }

    /// Arm the retry timer for the earliest deadline, or disarm it.
    fn rearm_insert_timer(&mut self) {
        match self.inserts.values().map(|job| job.deadline).min() {
            Some(deadline) => {
                let delay = deadline.saturating_sub(self.clock.now());
                self.arm_timer(TimerKind::InsertRetry, Duration::from_millis(delay));
            }
            None => self.cancel_timer(TimerKind::InsertRetry),
        }
    }
}
