//! Routes each wire message to the phase that owns it.

use super::Glacier;
use crate::directory::EventKind;
use crate::erasure::Fragment;
use crate::error::Result;
use crate::id::{FragmentKey, NodeId};
use crate::manifest::Manifest;
use crate::protocol::{Envelope, KnownHolder, Message};
use crate::substrate::StoredFragment;

impl Glacier {
    pub(super) async fn deliver(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope {
            uid,
            source,
            destination,
            message,
        } = envelope;
        tracing::debug!(uid, source = %source, kind = message.kind(), "message received");

        match message {
            Message::Query { key } => self.on_query(source, key).await,
            Message::Response { key, have_it } => {
                if self.handoffs.contains_key(&key) {
                    self.on_handoff_response(source, key, have_it).await
                } else {
                    self.on_insert_response(source, key, have_it)
                }
            }
            Message::Insert {
                key,
                manifest,
                fragment,
                known_holders,
            } => {
                self.on_insert(source, key, manifest, fragment, known_holders)
                    .await
            }
            Message::Receipt { key } => {
                if self.handoffs.contains_key(&key) {
                    self.on_handoff_receipt(source, key).await
                } else {
                    self.on_insert_receipt(source, key)
                }
            }
            Message::Status(report) => self.on_status(source, destination, report),
            Message::Sticky {
                origin,
                destination,
                report,
                ttl,
            } => self.on_sticky(origin, destination, report, ttl),
            Message::Fetch { key } => self.on_fetch(source, key).await,
            Message::Data {
                key,
                fragment,
                manifest,
            } => self.on_data(source, key, fragment, manifest),
        }
    }

    async fn on_query(&mut self, source: NodeId, key: FragmentKey) -> Result<()> {
        let have_it = self.fragments.exists(&key).await?;
        self.send(source, Message::Response { key, have_it });
        Ok(())
    }

    /// Accept a fragment pushed by an inserter or a hand-off.
    async fn on_insert(
        &mut self,
        source: NodeId,
        key: FragmentKey,
        manifest: Manifest,
        fragment: Fragment,
        known_holders: Vec<KnownHolder>,
    ) -> Result<()> {
        if key.index >= self.directory.num_fragments()
            || fragment.index != key.index
            || !manifest.verifies_fragment(&fragment)
        {
            tracing::warn!(key = %key, source = %source, "insert does not match its manifest, dropped");
            return Ok(());
        }

        if self.fragments.exists(&key).await? {
            tracing::debug!(key = %key, "fragment already stored, confirming");
            self.send(source, Message::Receipt { key });
            return Ok(());
        }

        let now = self.clock.now();
        self.fragments
            .put(
                key,
                StoredFragment {
                    fragment,
                    manifest: manifest.clone(),
                },
            )
            .await?;
        let stored = self.directory.mark_new_fragment_stored(&key, &manifest, now);
        self.escalate(stored)?;

        for known in known_holders {
            let kind = if known.certain {
                EventKind::Acquired
            } else {
                EventKind::NewHolder
            };
            let news = self.directory.add_fragment_news(
                &key.version_key.fragment(known.index),
                known.holder,
                kind,
                Some(source),
                now,
            );
            self.escalate(news)?;
        }
        // a handing-off sender is retiring its copy of this fragment
        self.directory.kill_holder(&key, &source);
        self.dirty = true;

        tracing::info!(key = %key, source = %source, "fragment stored");
        self.send(source, Message::Receipt { key });
        Ok(())
    }
}
