use crate::message::{self, Envelope, Payload};
use crate::queue::transfer::Taken;
use crate::queue::{QueueDescriptor, Shared};
use crate::storage::{Batch, Command, Store, StoreError, StoreResult};
use crate::{Priority, QueueError, Result};
use log::{debug, warn};
use std::sync::Arc;

/// Storage strategy of a queue: a Redis list or a weight-ordered sorted set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    List,
    Sorted,
}

/// Which end of the queue an operation works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum End {
    Head,
    Tail,
}

impl Backing {
    pub fn from_sorted(is_sort: bool) -> Self {
        if is_sort { Backing::Sorted } else { Backing::List }
    }

    /// Sorted queues ignore `end`: position comes from the envelope weight.
    pub(crate) fn insert(&self, queue_key: &str, end: End, envelope: &Envelope) -> Command {
        self.insert_packed(queue_key, end, message::pack(envelope), envelope.weight)
    }

    /// Same as [`insert`](Self::insert) for an entry already in its stored form.
    pub(crate) fn insert_packed(
        &self,
        queue_key: &str,
        end: End,
        packed: String,
        score: f64,
    ) -> Command {
        match (self, end) {
            (Backing::Sorted, _) => Command::ZAdd {
                key: queue_key.to_string(),
                score,
                member: packed,
            },
            (Backing::List, End::Head) => Command::LPush {
                key: queue_key.to_string(),
                value: packed,
            },
            (Backing::List, End::Tail) => Command::RPush {
                key: queue_key.to_string(),
                value: packed,
            },
        }
    }

    pub(crate) async fn len(&self, store: &dyn Store, queue_key: &str) -> StoreResult<u64> {
        match self {
            Backing::List => store.llen(queue_key).await,
            Backing::Sorted => store.zcard(queue_key).await,
        }
    }

    /// Lists pop the entry; sorted sets only read it and the transfer removes it.
    pub(crate) async fn take(
        &self,
        store: &dyn Store,
        queue_key: &str,
        end: End,
    ) -> StoreResult<Option<String>> {
        match (self, end) {
            (Backing::List, End::Head) => store.lpop(queue_key).await,
            (Backing::List, End::Tail) => store.rpop(queue_key).await,
            (Backing::Sorted, End::Head) => Ok(store.zfirst(queue_key).await?.map(|(m, _)| m)),
            (Backing::Sorted, End::Tail) => Ok(store.zlast(queue_key).await?.map(|(m, _)| m)),
        }
    }

    pub(crate) fn removal(&self, queue_key: &str, raw: &str) -> Option<Command> {
        match self {
            Backing::List => None,
            Backing::Sorted => Some(Command::ZRem {
                key: queue_key.to_string(),
                member: raw.to_string(),
            }),
        }
    }
}

/// Batch failures are transient; anything else means the store is unreachable.
pub(crate) fn batch_error(err: StoreError) -> QueueError {
    match err {
        StoreError::BatchAborted(msg) => QueueError::QueueOperationFailed(msg),
        other => QueueError::from(other),
    }
}

/// Handle to one named queue. Cheap to clone.
#[derive(Clone)]
pub struct Queue {
    pub(super) shared: Arc<Shared>,
    pub(super) descriptor: QueueDescriptor,
    pub(super) trans_time: i64,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("descriptor", &self.descriptor)
            .field("trans_time", &self.trans_time)
            .finish()
    }
}

impl Queue {
    pub(crate) fn new(shared: Arc<Shared>, descriptor: QueueDescriptor, trans_time: i64) -> Self {
        Self {
            shared,
            descriptor,
            trans_time,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.queue_name
    }

    pub fn key(&self) -> &str {
        &self.descriptor.queue_key
    }

    pub fn descriptor(&self) -> &QueueDescriptor {
        &self.descriptor
    }

    pub fn is_sort(&self) -> bool {
        self.descriptor.is_sort
    }

    pub fn priority(&self) -> Priority {
        self.descriptor.priority
    }

    pub fn backing(&self) -> Backing {
        Backing::from_sorted(self.descriptor.is_sort)
    }

    /// Message lifetime in seconds, 0 = never expires
    pub fn expire_secs(&self) -> i64 {
        self.descriptor.expire_secs
    }

    /// Reclaim window in seconds
    pub fn trans_time(&self) -> i64 {
        self.trans_time
    }

    pub(super) fn store(&self) -> &dyn Store {
        self.shared.store.as_ref()
    }

    async fn ensure_registered(&self) -> Result<()> {
        if self.shared.registry.queue_exists(self.name()).await? {
            Ok(())
        } else {
            Err(QueueError::QueueNotExist(self.name().to_string()))
        }
    }

    /// Inserts at the head. `weight` (0..=99) orders sorted queues and is ignored by lists.
    pub async fn add(&self, msg: Payload, weight: i64) -> Result<()> {
        self.insert(msg, weight, End::Head).await
    }

    /// Inserts at the tail.
    pub async fn push(&self, msg: Payload, weight: i64) -> Result<()> {
        self.insert(msg, weight, End::Tail).await
    }

    pub async fn add_multi(&self, msgs: Vec<Payload>) -> Result<()> {
        self.insert_multi(msgs, End::Head).await
    }

    pub async fn push_multi(&self, msgs: Vec<Payload>) -> Result<()> {
        self.insert_multi(msgs, End::Tail).await
    }

    async fn insert(&self, msg: Payload, weight: i64, end: End) -> Result<()> {
        if msg.is_empty() {
            return Err(QueueError::QueueMessageEmpty);
        }
        self.ensure_registered().await?;

        let envelope = message::wrap(msg, weight, self.expire_secs());
        let command = self.backing().insert(self.key(), end, &envelope);
        let affected = self.store().run(command).await.map_err(batch_error)?;

        if affected <= 0 {
            return Err(QueueError::QueueOperationFailed(format!(
                "insert into {} was not applied",
                self.name()
            )));
        }

        debug!("Queued message on {}", self.name());
        Ok(())
    }

    async fn insert_multi(&self, msgs: Vec<Payload>, end: End) -> Result<()> {
        if msgs.is_empty() || msgs.iter().any(|m| m.is_empty()) {
            return Err(QueueError::QueueMessageEmpty);
        }
        self.ensure_registered().await?;

        let backing = self.backing();
        let mut batch = Batch::new();
        for msg in msgs {
            let envelope = message::wrap(msg, 0, self.expire_secs());
            batch.push(backing.insert(self.key(), end, &envelope));
        }

        let replies = self.store().exec(&batch).await.map_err(batch_error)?;
        match replies.first() {
            Some(first) if *first != 0 => {
                debug!("Queued {} messages on {}", batch.len(), self.name());
                Ok(())
            }
            _ => Err(QueueError::QueueOperationFailed(format!(
                "batch insert into {} was not applied",
                self.name()
            ))),
        }
    }

    /// Takes the head message and parks it in the pending store.
    ///
    /// `Ok(None)` when the queue is empty, the entry was unreadable, or
    /// another consumer claimed the same entry first.
    pub async fn shift(&self) -> Result<Option<Payload>> {
        self.take(End::Head).await
    }

    /// Same as [`shift`](Self::shift) from the tail.
    pub async fn pop(&self) -> Result<Option<Payload>> {
        self.take(End::Tail).await
    }

    async fn take(&self, end: End) -> Result<Option<Payload>> {
        self.ensure_registered().await?;

        let backing = self.backing();
        if backing.len(self.store(), self.key()).await? == 0 {
            return Ok(None);
        }

        let Some(raw) = backing.take(self.store(), self.key(), end).await? else {
            return Ok(None);
        };

        let Some(envelope) = message::decode(&raw) else {
            warn!("Dropping malformed entry from {}: {:?}", self.name(), raw);
            if let Some(command) = backing.removal(self.key(), &raw) {
                self.store().run(command).await?;
            }
            return Ok(None);
        };

        let taken = match backing {
            Backing::List => Taken::Popped(&raw),
            Backing::Sorted => Taken::Peeked(&raw),
        };
        if self.transfer_entry(&envelope, taken, end).await? {
            Ok(Some(envelope.into_payload()))
        } else {
            Ok(None)
        }
    }

    pub async fn len(&self) -> Result<u64> {
        Ok(self.backing().len(self.store(), self.key()).await?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drops every queued message; the registration stays. Pending messages are untouched.
    pub async fn clear(&self) -> Result<bool> {
        let removed = self
            .store()
            .run(Command::Del {
                key: self.key().to_string(),
            })
            .await?;
        Ok(removed > 0)
    }

    /// Drops the queue contents and its registration.
    ///
    /// Returns whether the queue was registered.
    pub async fn delete(&self) -> Result<bool> {
        let mut batch = Batch::new();
        batch
            .del(self.key())
            .hdel(self.shared.keys.registry(), self.name());

        let replies = self.store().exec(&batch).await.map_err(batch_error)?;
        self.shared.registry.evict(self.name());

        let registered = replies.get(1).copied().unwrap_or(0) > 0;
        if registered {
            debug!("Deleted queue {}", self.name());
        }
        Ok(registered)
    }
}
