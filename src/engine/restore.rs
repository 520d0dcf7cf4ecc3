//! Recovery of lost objects and missing fragments.
//!
//! ```text
//! AskingPrimary       -> WaitingForPrimary      first step
//! WaitingForPrimary   -> WaitingForPrimary      fetch from the primary again
//!                     -> Recoding               enough fragments held locally
//!                     -> CollectingFragments    enough live fragments known
//!                     -> Canceled               unrecoverable for now
//! CollectingFragments -> CollectingFragments    fetch one more fragment
//!                     -> Recoding               enough fragments collected
//!                     -> Canceled               out of attempts or candidates
//! Recoding            -> Canceled               decode, reinsert, done
//! ```
//!
//! A missing fragment starts in `AskingPrimary`. A primary replica that
//! missed its audits starts in `WaitingForPrimary` with no fetches left and
//! goes straight to the fragment holders.
//!
//! Canceled jobs are dropped at the end of every cycle. While jobs remain
//! the restore timer is re-armed; once the table drains, the hand-off
//! phase begins.

use super::{Glacier, HandoffJob, TimerKind};
use crate::erasure::Fragment;
use crate::error::Result;
use crate::id::{FragmentKey, NodeId, VersionKey};
use crate::manifest::{Manifest, StoredObject};
use crate::placement::locate_fragment;
use crate::protocol::Message;
use rand::seq::SliceRandom;

/// Where a restore job stands.
///
/// `WaitingForPrimary` counts down fetches sent to the primary replica and
/// moves on once none are left. An audit escalation starts there with no
/// fetches left, since the unanswered audits already asked the primary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreStatus {
    /// Not started; the first step grants the primary its fetch attempts.
    AskingPrimary,
    /// Fetching from the primary replica while attempts remain.
    WaitingForPrimary,
    /// Fetching fragments from their holders one at a time.
    CollectingFragments,
    /// Enough fragments are held to decode.
    Recoding,
    /// Finished or given up; dropped at the end of the cycle.
    Canceled,
}

/// What a restore job is trying to bring back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreTarget {
    /// The primary replica stopped answering audits.
    Object,
    /// Fragment `i` has no live holder.
    Fragment(usize),
}

#[derive(Debug)]
pub struct RestoreJob {
    version_key: VersionKey,
    target: RestoreTarget,
    status: RestoreStatus,
    attempts_left: u32,
    checked: Vec<bool>,
    have: Vec<Option<Fragment>>,
}

impl RestoreJob {
    fn new(
        version_key: VersionKey,
        target: RestoreTarget,
        status: RestoreStatus,
        attempts_left: u32,
        num_fragments: usize,
    ) -> Self {
        Self {
            version_key,
            target,
            status,
            attempts_left,
            checked: vec![false; num_fragments],
            have: vec![None; num_fragments],
        }
    }

    pub fn version_key(&self) -> VersionKey {
        self.version_key
    }

    pub fn target(&self) -> RestoreTarget {
        self.target
    }

    pub fn status(&self) -> RestoreStatus {
        self.status
    }

    pub fn attempts_left(&self) -> u32 {
        self.attempts_left
    }

    /// Fragments gathered so far.
    pub fn collected(&self) -> usize {
        self.have.iter().filter(|f| f.is_some()).count()
    }

    fn fetch_key(&self) -> FragmentKey {
        match self.target {
            RestoreTarget::Object => self.version_key.fragment(0),
            RestoreTarget::Fragment(index) => self.version_key.fragment(index),
        }
    }
}

/// Running totals of restore outcomes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub objects_recovered: u64,
    pub fragments_regenerated: u64,
    pub unrecoverable: u64,
    pub abandoned: u64,
}

impl Glacier {
    /// Turn unanswered audits and under-replicated objects into jobs.
    pub(super) async fn determine_restore_jobs(&mut self) -> Result<()> {
        let n = self.config.protocol.num_fragments;
        let k = self.config.protocol.num_survivors;
        let max = self.config.protocol.max_concurrent_restores;
        let mut new_jobs = Vec::new();

        for vk in std::mem::take(&mut self.audits) {
            if self.restores.len() + new_jobs.len() >= max {
                break;
            }
            if self.restores.contains_key(&vk) || self.directory.file(&vk).is_none() {
                continue;
            }
            tracing::warn!(key = %vk, "no audit response, primary replica presumed lost");
            new_jobs.push(RestoreJob::new(
                vk,
                RestoreTarget::Object,
                RestoreStatus::WaitingForPrimary,
                0,
                n,
            ));
        }

        let attempts = (self.config.protocol.max_restore_attempt_factor * n as f64) as u32;
        let mut candidates = Vec::new();
        for file in self.directory.files() {
            if self.restores.contains_key(&file.key)
                || new_jobs.iter().any(|j: &RestoreJob| j.version_key == file.key)
            {
                continue;
            }
            let missing: Vec<usize> = (0..n)
                .filter(|&i| !file.slots(i).iter().any(|s| s.is_live()))
                .collect();
            let live = n - missing.len();
            if live < k {
                continue;
            }
            // one random missing fragment per object keeps collisions rare
            if let Some(&index) = missing.choose(&mut self.rng) {
                candidates.push(RestoreJob::new(
                    file.key,
                    RestoreTarget::Fragment(index),
                    RestoreStatus::AskingPrimary,
                    attempts,
                    n,
                ));
            }
        }
        candidates.shuffle(&mut self.rng);
        let room = max.saturating_sub(self.restores.len() + new_jobs.len());
        for job in candidates.into_iter().take(room) {
            tracing::info!(key = %job.fetch_key(), "restoring missing fragment");
            new_jobs.push(job);
        }

        for mut job in new_jobs {
            self.load_local_fragments(&mut job).await;
            self.restores.insert(job.version_key, job);
        }
        Ok(())
    }

    async fn load_local_fragments(&self, job: &mut RestoreJob) {
        let Some(file) = self.directory.file(&job.version_key) else {
            return;
        };
        for index in file.local_fragments() {
            job.checked[index] = true;
            let key = job.version_key.fragment(index);
            match self.fragments.get(&key).await {
                Ok(Some(stored)) => job.have[index] = Some(stored.fragment),
                Ok(None) => tracing::warn!(key = %key, "local fragment missing from store"),
                Err(e) => tracing::warn!(key = %key, error = %e, "cannot read local fragment"),
            }
        }
    }

    /// Advance every restore job by one step.
    pub(super) async fn restore_cycle(&mut self) -> Result<()> {
        let keys: Vec<VersionKey> = self.restores.keys().copied().collect();
        for vk in keys {
            self.restore_step(vk);
        }

        let recoding: Vec<VersionKey> = self
            .restores
            .values()
            .filter(|job| job.status == RestoreStatus::Recoding)
            .map(|job| job.version_key)
            .collect();
        for vk in recoding {
            self.recode(vk);
        }

        self.restores
            .retain(|_, job| job.status != RestoreStatus::Canceled);
        if self.restores.is_empty() {
            self.begin_handoffs().await
        } else {
            tracing::debug!(jobs = self.restores.len(), "restore cycle done");
            let cycle = self.config.timing.restore_cycle;
            self.arm_timer(TimerKind::Restore, cycle);
            Ok(())
        }
    }

    fn restore_step(&mut self, vk: VersionKey) {
        let k = self.config.protocol.num_survivors;
        let live = self
            .directory
            .file(&vk)
            .map_or(0, |file| file.live_fragment_count());
        let from_fragments =
            (self.config.protocol.max_restore_from_fragment_factor * k as f64) as u32;
        let max_audit_attempts = self.config.protocol.max_audit_attempts;

        let Some(job) = self.restores.get_mut(&vk) else {
            return;
        };

        if job.status == RestoreStatus::AskingPrimary {
            job.status = RestoreStatus::WaitingForPrimary;
            job.attempts_left = max_audit_attempts;
        }

        if job.status == RestoreStatus::WaitingForPrimary {
            if job.attempts_left > 0 {
                job.attempts_left -= 1;
                let key = job.fetch_key();
                tracing::debug!(key = %key, attempts_left = job.attempts_left, "asking primary");
                self.send(vk.key, Message::Fetch { key });
                return;
            }
            if live < k {
                tracing::warn!(key = %vk, live, needed = k, "too few live fragments, cannot restore");
                job.status = RestoreStatus::Canceled;
                self.restore_stats.unrecoverable += 1;
            } else if job.collected() >= k {
                tracing::warn!(key = %vk, "primary silent, recoding from local fragments");
                job.status = RestoreStatus::Recoding;
            } else {
                tracing::warn!(key = %vk, "primary silent, collecting fragments");
                job.status = RestoreStatus::CollectingFragments;
                job.attempts_left = from_fragments;
            }
            return;
        }

        if job.status == RestoreStatus::CollectingFragments {
            if job.attempts_left == 0 {
                tracing::warn!(key = %vk, "giving up restore, attempt limit reached");
                job.status = RestoreStatus::Canceled;
                self.restore_stats.abandoned += 1;
                return;
            }
            let candidates: Vec<(usize, NodeId)> = self
                .directory
                .file(&vk)
                .map(|file| {
                    (0..file.num_fragments())
                        .filter(|&i| job.have[i].is_none() && !job.checked[i])
                        .flat_map(|i| file.live_remote_holders(i).map(move |h| (i, h)))
                        .collect()
                })
                .unwrap_or_default();
            let Some(&(index, holder)) = candidates.choose(&mut self.rng) else {
                tracing::warn!(key = %vk, "giving up restore, no more candidates");
                job.status = RestoreStatus::Canceled;
                self.restore_stats.abandoned += 1;
                return;
            };
            job.checked[index] = true;
            job.attempts_left -= 1;
            let key = vk.fragment(index);
            tracing::debug!(key = %key, holder = %holder, attempts_left = job.attempts_left, "fetching fragment");
            self.send(holder, Message::Fetch { key });
        }
    }

    /// Decode the object, reinsert it and queue the regenerated fragment.
    fn recode(&mut self, vk: VersionKey) {
        let Some(job) = self.restores.get_mut(&vk) else {
            return;
        };
        job.status = RestoreStatus::Canceled;
        let target = job.target;
        let material: Vec<Fragment> = job
            .have
            .iter()
            .flatten()
            .take(self.config.protocol.num_survivors)
            .cloned()
            .collect();

        let bytes = match self.codec.decode(&material) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key = %vk, error = %e, "decoding failed");
                self.restore_stats.abandoned += 1;
                return;
            }
        };
        let Some(manifest) = self.directory.file(&vk).map(|file| file.manifest.clone()) else {
            tracing::warn!(key = %vk, "object forgotten during restore");
            return;
        };
        if !manifest.verifies_object(&bytes) {
            tracing::warn!(key = %vk, "decoded object does not match its manifest");
            self.restore_stats.abandoned += 1;
            return;
        }
        let object = match StoredObject::from_bytes(&bytes) {
            Ok(object) if object.version_key() == vk => object,
            Ok(object) => {
                tracing::warn!(key = %vk, decoded = %object.version_key(), "decoded a different object");
                self.restore_stats.abandoned += 1;
                return;
            }
            Err(e) => {
                tracing::warn!(key = %vk, error = %e, "decoded bytes are not an object");
                self.restore_stats.abandoned += 1;
                return;
            }
        };

        tracing::info!(key = %vk, "object recovered from fragments");
        self.restore_stats.objects_recovered += 1;

        if let RestoreTarget::Fragment(index) = target {
            match object.encode(self.codec.as_ref()) {
                Ok((_, fragments)) => match fragments.into_iter().nth(index) {
                    Some(fragment) if manifest.verifies_fragment(&fragment) => {
                        self.queue_restored_fragment(vk.fragment(index), fragment, manifest);
                    }
                    _ => tracing::warn!(key = %vk, index, "re-encoded fragment does not match manifest"),
                },
                Err(e) => tracing::warn!(key = %vk, error = %e, "re-encoding failed"),
            }
        }
        self.spawn_primary_insert(object, None);
    }

    fn queue_restored_fragment(&mut self, key: FragmentKey, fragment: Fragment, manifest: Manifest) {
        let destination = locate_fragment(&key, self.directory.num_fragments());
        tracing::info!(key = %key, destination = %destination, "fragment regenerated, awaiting placement");
        self.restore_stats.fragments_regenerated += 1;
        self.handoffs
            .entry(key)
            .or_insert_with(|| HandoffJob::restored(key, destination, fragment, manifest));
    }

    /// Answer a fetch from the local store or by re-encoding a full replica.
    pub(super) async fn on_fetch(&mut self, source: NodeId, key: FragmentKey) -> Result<()> {
        if let Some(stored) = self.fragments.get(&key).await? {
            self.send(
                source,
                Message::Data {
                    key,
                    fragment: stored.fragment,
                    manifest: stored.manifest,
                },
            );
            return Ok(());
        }

        match self.primary.get(&key.version_key.key).await? {
            Some(object) if object.version_key() == key.version_key => {
                let (manifest, fragments) = object.encode(self.codec.as_ref())?;
                if let Some(fragment) = fragments.into_iter().nth(key.index) {
                    tracing::debug!(key = %key, "fetch answered from full replica");
                    self.send(
                        source,
                        Message::Data {
                            key,
                            fragment,
                            manifest,
                        },
                    );
                }
            }
            _ => tracing::debug!(key = %key, "fetch for unknown fragment"),
        }
        Ok(())
    }

    pub(super) fn on_data(
        &mut self,
        source: NodeId,
        key: FragmentKey,
        fragment: Fragment,
        manifest: Manifest,
    ) -> Result<()> {
        let k = self.config.protocol.num_survivors;
        let trusted = self
            .directory
            .file(&key.version_key)
            .map_or(manifest, |file| file.manifest.clone());
        let Some(job) = self.restores.get_mut(&key.version_key) else {
            tracing::warn!(key = %key, source = %source, "unexpected fragment data, discarded");
            return Ok(());
        };
        if fragment.index != key.index || !trusted.verifies_fragment(&fragment) {
            tracing::warn!(key = %key, source = %source, "fragment data does not match manifest");
            return Ok(());
        }

        match (job.status, job.target) {
            (RestoreStatus::WaitingForPrimary, RestoreTarget::Object) => {
                tracing::info!(key = %key.version_key, "primary answered, restore not needed");
                self.restores.remove(&key.version_key);
            }
            (RestoreStatus::WaitingForPrimary, RestoreTarget::Fragment(index)) if index == key.index => {
                self.restores.remove(&key.version_key);
                self.queue_restored_fragment(key, fragment, trusted);
            }
            (RestoreStatus::CollectingFragments, _) => {
                job.have[key.index] = Some(fragment);
                let collected = job.collected();
                tracing::debug!(key = %key, collected, needed = k, "fragment collected");
                if collected >= k {
                    job.status = RestoreStatus::Recoding;
                }
            }
            (status, _) => {
                tracing::warn!(key = %key, status = ?status, "fragment data in unexpected restore state");
            }
        }
        Ok(())
    }
}
