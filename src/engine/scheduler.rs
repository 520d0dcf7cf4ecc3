//! Phase timers and the periodic cycle.
//!
//! ```text
//! StatusCast fires -> audit probes sent      (arms Audit)
//! Audit fires      -> expiry, restore jobs   (arms Restore while jobs remain)
//! Restore drains   -> hand-off queries       (arms Handoff)
//! Handoff fires    -> status-cast, snapshot  (arms StatusCast)
//! ```
//!
//! The insert-retry timer runs independently of the cycle.

use super::{Event, Glacier};
use crate::error::Result;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    InsertRetry,
    StatusCast,
    Audit,
    Restore,
    Handoff,
}

/// One pending sleep per timer kind.
#[derive(Default)]
pub(super) struct Timers {
    pending: HashMap<TimerKind, JoinHandle<()>>,
}

impl Timers {
    /// Post `Event::Timer(kind)` after `delay`, replacing any pending timer
    /// of the same kind. Requires a running tokio runtime.
    pub(super) fn arm(
        &mut self,
        kind: TimerKind,
        delay: Duration,
        mailbox: &mpsc::UnboundedSender<Event>,
    ) {
        let mailbox = mailbox.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = mailbox.send(Event::Timer(kind));
        });
        if let Some(previous) = self.pending.insert(kind, task) {
            previous.abort();
        }
    }

    pub(super) fn cancel(&mut self, kind: TimerKind) {
        if let Some(task) = self.pending.remove(&kind) {
            task.abort();
        }
    }

    pub(super) fn cancel_all(&mut self) {
        for (_, task) in self.pending.drain() {
            task.abort();
        }
    }

    /// Forget a timer that just fired.
    pub(super) fn fired(&mut self, kind: TimerKind) {
        self.pending.remove(&kind);
    }

    pub(super) fn is_armed(&self, kind: TimerKind) -> bool {
        self.pending.get(&kind).is_some_and(|task| !task.is_finished())
    }
}

impl Glacier {
    pub(super) fn arm_timer(&mut self, kind: TimerKind, delay: Duration) {
        tracing::trace!(timer = ?kind, delay = ?delay, "timer armed");
        self.timers.arm(kind, delay, &self.mailbox);
    }

    pub(super) fn cancel_timer(&mut self, kind: TimerKind) {
        self.timers.cancel(kind);
    }

    pub(super) async fn on_timer(&mut self, kind: TimerKind) -> Result<()> {
        self.timers.fired(kind);
        match kind {
            TimerKind::InsertRetry => self.on_insert_timeout(),
            TimerKind::StatusCast => {
                self.begin_audit();
                Ok(())
            }
            TimerKind::Audit => self.on_audit_timeout().await,
            TimerKind::Restore => self.restore_cycle().await,
            TimerKind::Handoff => self.on_handoff_timeout(),
        }
    }

    /// End of the cycle: give up on unanswered hand-offs, gossip, persist.
    fn on_handoff_timeout(&mut self) -> Result<()> {
        self.handoffs.retain(|key, job| {
            if !job.restored {
                tracing::debug!(key = %key, "hand-off not confirmed this cycle");
            }
            job.restored
        });

        self.status_cast();
        let now = self.clock.now();
        self.directory.set_last_status_cast(now);
        self.dirty = true;
        self.persist()?;
        self.schedule_next_status_cast();
        Ok(())
    }

    /// Arm the next cycle one interval after the last status-cast, jittered
    /// and never sooner than the minimum delay.
    pub(super) fn schedule_next_status_cast(&mut self) {
        let timing = &self.config.timing;
        let interval = timing.status_cast_interval.as_millis() as u64;
        let min_delay = timing.status_cast_min_delay.as_millis() as u64;
        let jitter = timing.status_cast_jitter.as_millis() as i64;

        let due = self.directory.last_status_cast().saturating_add(interval);
        let base = due.saturating_sub(self.clock.now()) as i64;
        let offset = if jitter > 0 {
            self.rng.gen_range(-jitter..=jitter)
        } else {
            0
        };
        let delay = (base + offset).max(min_delay as i64) as u64;

        tracing::debug!(delay_ms = delay, "next status-cast scheduled");
        self.arm_timer(TimerKind::StatusCast, Duration::from_millis(delay));
    }
}
