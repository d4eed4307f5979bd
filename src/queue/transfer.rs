//! Pending store protocol.
//!
//! A shifted message is parked under its fingerprint in two places per
//! priority class: a hash holding the [`TransferRecord`] and a sorted set
//! scoring the fingerprint by transfer time. Confirming removes both;
//! unconfirmed entries are returned to their queue by the reclaim sweep.

use crate::message::{self, Envelope, Payload, TransferRecord};
use crate::queue::engine::{Backing, End};
use crate::queue::{Queue, QueueDescriptor};
use crate::storage::{Batch, Command};
use crate::{QueueError, Result};
use log::{debug, error, warn};
use std::collections::HashSet;

/// What to confirm: the message as returned by shift, or its fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmTarget {
    Message(Payload),
    Fingerprint(String),
}

impl From<Payload> for ConfirmTarget {
    fn from(msg: Payload) -> Self {
        ConfirmTarget::Message(msg)
    }
}

impl From<&Payload> for ConfirmTarget {
    fn from(msg: &Payload) -> Self {
        ConfirmTarget::Message(msg.clone())
    }
}

impl From<String> for ConfirmTarget {
    fn from(fingerprint: String) -> Self {
        ConfirmTarget::Fingerprint(fingerprint)
    }
}

impl From<&str> for ConfirmTarget {
    fn from(fingerprint: &str) -> Self {
        ConfirmTarget::Fingerprint(fingerprint.to_string())
    }
}

/// Where the entry being transferred came from.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Taken<'a> {
    /// Popped off a list; this caller holds the only copy.
    Popped(&'a str),
    /// Read from a sorted set and still in it until the transfer removes it.
    Peeked(&'a str),
    /// Handed in by the caller; may still be queued under this packed form.
    Detached(Option<&'a str>),
}

/// Pending-set score: transfer time in seconds with microsecond precision
pub(crate) fn transfer_score() -> f64 {
    message::next_tick_micros() as f64 / 1e6
}

/// Command putting `envelope` back at the tail of the queue described by `descriptor`.
pub(crate) fn requeue_into(descriptor: &QueueDescriptor, envelope: &Envelope) -> Command {
    Backing::from_sorted(descriptor.is_sort).insert(&descriptor.queue_key, End::Tail, envelope)
}

impl Queue {
    fn transfer_table(&self) -> String {
        self.shared.keys.transfer_table(self.priority())
    }

    fn transfer_queue(&self) -> String {
        self.shared.keys.transfer_queue(self.priority())
    }

    /// Pending-store key of `msg` on this queue.
    pub fn trans_key(&self, msg: &Payload) -> String {
        message::fingerprint(self.name(), msg)
    }

    pub fn trans_keys(&self, msgs: &[Payload]) -> Vec<String> {
        msgs.iter().map(|msg| self.trans_key(msg)).collect()
    }

    fn resolve(&self, target: &ConfirmTarget) -> Result<String> {
        match target {
            ConfirmTarget::Message(msg) if msg.is_empty() => Err(QueueError::QueueMessageEmpty),
            ConfirmTarget::Message(msg) => Ok(self.trans_key(msg)),
            ConfirmTarget::Fingerprint(fp) if fp.is_empty() => Err(QueueError::QueueMessageEmpty),
            ConfirmTarget::Fingerprint(fp) => Ok(fp.clone()),
        }
    }

    /// Parks `msg` in the pending store without taking it from the queue.
    pub async fn transfer(&self, msg: &Payload) -> Result<()> {
        if msg.is_empty() {
            return Err(QueueError::QueueMessageEmpty);
        }

        let envelope = message::wrap(msg.clone(), 0, self.expire_secs());
        // a wrapped message may still sit in a sorted queue under its packed form
        let raw = message::is_wrapped(msg).then(|| message::pack(&envelope));
        self.transfer_entry(&envelope, Taken::Detached(raw.as_deref()), End::Head)
            .await
            .map(|_| ())
    }

    /// Moves a taken entry into the pending store.
    ///
    /// Returns `false` when another consumer claimed a peeked entry first;
    /// nothing is written in that case.
    pub(super) async fn transfer_entry(
        &self,
        envelope: &Envelope,
        taken: Taken<'_>,
        end: End,
    ) -> Result<bool> {
        let fp = envelope.fingerprint(self.name());
        let record = TransferRecord::new(self.name(), envelope.clone());

        let mut batch = Batch::new();
        batch
            .zadd(self.transfer_queue(), transfer_score(), &fp)
            .hset(self.transfer_table(), &fp, record.to_json());

        let outcome = match taken {
            Taken::Peeked(raw) => {
                batch.zrem(self.key(), raw);
                self.store().exec_if_member(self.key(), raw, &batch).await
            }
            Taken::Detached(raw) => {
                let removal = raw.and_then(|raw| self.backing().removal(self.key(), raw));
                if let Some(command) = removal {
                    batch.push(command);
                }
                self.store().exec(&batch).await.map(Some)
            }
            Taken::Popped(_) => self.store().exec(&batch).await.map(Some),
        };

        match outcome {
            Ok(Some(_)) => {
                debug!("Transferred {} from {}", fp, self.name());
                Ok(true)
            }
            Ok(None) => {
                debug!("Entry on {} was claimed by another consumer", self.name());
                Ok(false)
            }
            Err(e) => {
                warn!("Transfer of {} from {} failed: {}", fp, self.name(), e);
                self.rollback_transfer(&fp).await;

                if let Some(command) = self.give_back(taken, end, envelope)
                    && let Err(requeue_err) = self.store().run(command).await
                {
                    error!(
                        "Message {} lost from {}: requeue failed: {}",
                        fp,
                        self.name(),
                        requeue_err
                    );
                }

                Err(QueueError::QueueMessageTransferFailed(e.to_string()))
            }
        }
    }

    /// Compensating insert after a failed transfer, `None` when the entry never left the queue.
    fn give_back(&self, taken: Taken<'_>, end: End, envelope: &Envelope) -> Option<Command> {
        match taken {
            Taken::Peeked(_) => None,
            Taken::Popped(raw) => Some(self.backing().insert_packed(
                self.key(),
                end,
                raw.to_string(),
                envelope.weight,
            )),
            Taken::Detached(_) => Some(self.backing().insert(self.key(), end, envelope)),
        }
    }

    async fn rollback_transfer(&self, fp: &str) {
        let mut batch = Batch::new();
        batch
            .zrem(self.transfer_queue(), fp)
            .hdel(self.transfer_table(), fp);
        if let Err(e) = self.store().exec(&batch).await {
            warn!("Rollback of pending entry {} failed: {}", fp, e);
        }
    }

    /// Requeue command for a pending record, `None` when its queue is gone.
    async fn requeue_command(&self, record: &TransferRecord) -> Result<Option<Command>> {
        if record.queue_name == self.name() {
            return Ok(Some(requeue_into(&self.descriptor, &record.envelope)));
        }
        Ok(self
            .shared
            .registry
            .descriptor(&record.queue_name)
            .await?
            .map(|descriptor| requeue_into(&descriptor, &record.envelope)))
    }

    /// Best effort: puts messages back after a failed confirm batch.
    async fn restore(&self, envelopes: Vec<(String, Envelope)>) {
        for (queue_name, envelope) in envelopes {
            let record = TransferRecord::new(&queue_name, envelope);
            let command = match self.requeue_command(&record).await {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(e) => {
                    error!("Cannot restore message for {}: {}", queue_name, e);
                    continue;
                }
            };
            if let Err(e) = self.store().run(command).await {
                error!("Cannot restore message for {}: {}", queue_name, e);
            }
        }
    }

    fn envelope_for(
        &self,
        target: &ConfirmTarget,
        record: Option<&TransferRecord>,
    ) -> Option<(String, Envelope)> {
        match (record, target) {
            (Some(record), _) => Some((record.queue_name.clone(), record.envelope.clone())),
            (None, ConfirmTarget::Message(msg)) => Some((
                self.name().to_string(),
                message::wrap(msg.clone(), 0, self.expire_secs()),
            )),
            (None, ConfirmTarget::Fingerprint(_)) => None,
        }
    }

    /// Settles a pending message. `ok = false` returns it to its queue in
    /// the same batch.
    ///
    /// Returns whether the message was pending. If the batch fails the
    /// message is pushed back onto its queue and
    /// [`QueueError::QueueMessageConfirmFailed`] is returned.
    pub async fn confirm(&self, ok: bool, target: impl Into<ConfirmTarget>) -> Result<bool> {
        let target = target.into();
        let fp = self.resolve(&target)?;
        let record = self.msg_by_trans_key(&fp).await?;

        if !ok && record.is_none() {
            debug!("Nothing pending under {} to return to {}", fp, self.name());
            return Ok(false);
        }

        let mut batch = Batch::new();
        batch
            .zrem(self.transfer_queue(), &fp)
            .hdel(self.transfer_table(), &fp);
        if !ok
            && let Some(record) = &record
            && let Some(command) = self.requeue_command(record).await?
        {
            batch.push(command);
        }

        match self.store().exec(&batch).await {
            Ok(replies) => {
                let pending = replies.iter().take(2).any(|n| *n > 0);
                debug!("Confirmed {} on {} (ok = {})", fp, self.name(), ok);
                Ok(pending)
            }
            Err(e) => {
                warn!("Confirm of {} on {} failed: {}", fp, self.name(), e);
                let restore = self.envelope_for(&target, record.as_ref());
                self.restore(restore.into_iter().collect()).await;
                Err(QueueError::QueueMessageConfirmFailed(e.to_string()))
            }
        }
    }

    /// Batch form of [`confirm`](Self::confirm). Returns how many targets were pending.
    pub async fn confirm_multi<T>(&self, ok: bool, targets: Vec<T>) -> Result<usize>
    where
        T: Into<ConfirmTarget>,
    {
        if targets.is_empty() {
            return Err(QueueError::QueueMessageEmpty);
        }

        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for target in targets {
            let target = target.into();
            let fp = self.resolve(&target)?;
            if seen.insert(fp.clone()) {
                resolved.push((fp, target));
            }
        }

        let fps: Vec<String> = resolved.iter().map(|(fp, _)| fp.clone()).collect();
        let records = self.msgs_by_trans_keys(&fps).await?;

        let mut batch = Batch::new();
        for fp in &fps {
            batch
                .zrem(self.transfer_queue(), fp)
                .hdel(self.transfer_table(), fp);
        }
        if !ok {
            for record in records.iter().flatten() {
                if let Some(command) = self.requeue_command(record).await? {
                    batch.push(command);
                }
            }
        }

        match self.store().exec(&batch).await {
            Ok(replies) => {
                let pending = replies
                    .chunks(2)
                    .take(fps.len())
                    .filter(|pair| pair.iter().any(|n| *n > 0))
                    .count();
                debug!(
                    "Confirmed {}/{} messages on {} (ok = {})",
                    pending,
                    fps.len(),
                    self.name(),
                    ok
                );
                Ok(pending)
            }
            Err(e) => {
                warn!(
                    "Confirm of {} messages on {} failed: {}",
                    fps.len(),
                    self.name(),
                    e
                );
                let restore = resolved
                    .iter()
                    .zip(records.iter())
                    .filter_map(|((_, target), record)| self.envelope_for(target, record.as_ref()))
                    .collect();
                self.restore(restore).await;
                Err(QueueError::QueueMessageConfirmFailed(e.to_string()))
            }
        }
    }

    /// Pending record stored under `fp` in this queue's priority class.
    pub async fn msg_by_trans_key(&self, fp: &str) -> Result<Option<TransferRecord>> {
        Ok(self
            .store()
            .hget(&self.transfer_table(), fp)
            .await?
            .and_then(|raw| TransferRecord::from_json(&raw)))
    }

    pub async fn msgs_by_trans_keys(&self, fps: &[String]) -> Result<Vec<Option<TransferRecord>>> {
        if fps.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .store()
            .hmget(&self.transfer_table(), fps)
            .await?
            .into_iter()
            .map(|raw| raw.and_then(|raw| TransferRecord::from_json(&raw)))
            .collect())
    }

    /// Pending messages across every queue of this priority class.
    pub async fn pending_len(&self) -> Result<u64> {
        Ok(self.store().zcard(&self.transfer_queue()).await?)
    }
}
