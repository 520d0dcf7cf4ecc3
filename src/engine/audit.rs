//! Primary-replica audits, holder expiry and the local storage check.

use super::{Event, Glacier, TimerKind};
use crate::error::Result;
use crate::id::VersionKey;
use futures::future::join_all;
use rand::seq::SliceRandom;
use std::sync::Arc;

impl Glacier {
    /// Start of the cycle: age the sticky queue and probe a random sample
    /// of primary replicas.
    pub(super) fn begin_audit(&mut self) {
        let dropped = self.sticky.expire();
        if dropped > 0 {
            tracing::debug!(dropped, "sticky statuses expired");
        }

        let max = self.config.protocol.max_concurrent_audits;
        let keys = self.directory.file_keys();
        let sample: Vec<VersionKey> = keys
            .choose_multiple(&mut self.rng, max)
            .copied()
            .collect();
        self.audits.extend(sample.iter().copied());
        tracing::debug!(objects = sample.len(), "auditing primary replicas");

        if !sample.is_empty() {
            let primary = Arc::clone(&self.primary);
            let mailbox = self.mailbox.clone();
            tokio::spawn(async move {
                let probes = sample.iter().map(|vk| {
                    let primary = Arc::clone(&primary);
                    async move {
                        let found = match primary.lookup_handles(&vk.key, 1).await {
                            Ok(handles) => !handles.is_empty(),
                            Err(e) => {
                                tracing::debug!(key = %vk, error = %e, "audit probe failed");
                                false
                            }
                        };
                        (*vk, found)
                    }
                });
                for (key, found) in join_all(probes).await {
                    let _ = mailbox.send(Event::AuditReply { key, found });
                }
            });
        }

        let timeout = self.config.timing.audit_timeout;
        self.arm_timer(TimerKind::Audit, timeout);
    }

    pub(super) fn on_audit_reply(&mut self, key: VersionKey, found: bool) {
        if found {
            self.audits.remove(&key);
        } else {
            tracing::debug!(key = %key, "primary replica not found");
        }
    }

    /// Audit window closed: expire the directory, then start restoring.
    pub(super) async fn on_audit_timeout(&mut self) -> Result<()> {
        self.check_local_fragments().await?;

        let now = self.clock.now();
        let policy = self.config.timing.expiry_policy();
        let report = self.directory.expire(now, &policy);
        if report.forgotten_slots > 0 || !report.silent_holders.is_empty() {
            tracing::info!(
                forgotten = report.forgotten_slots,
                silent = report.silent_holders.len(),
                evicted = report.evicted_holders.len(),
                dropped_files = report.dropped_files,
                "holder entries expired"
            );
            self.dirty = true;
        }

        self.determine_restore_jobs().await?;
        self.restore_cycle().await
    }

    /// Drop directory entries for local fragments the store no longer has.
    async fn check_local_fragments(&mut self) -> Result<()> {
        let local: Vec<_> = self
            .directory
            .files()
            .flat_map(|file| {
                let key = file.key;
                file.local_fragments()
                    .into_iter()
                    .map(move |index| key.fragment(index))
            })
            .collect();
        for key in local {
            if !self.fragments.exists(&key).await? {
                tracing::warn!(key = %key, "fragment vanished from local store");
                self.directory.forget_local(&key);
                self.dirty = true;
            }
        }
        Ok(())
    }
}
