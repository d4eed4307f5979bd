//! Returns abandoned pending messages to their queues.
//!
//! One sweep per priority class runs at a time across all hosts, guarded
//! by a lock keyed on the class. The sweep walks the pending set oldest
//! first and stops once its window is used up.

use crate::lock::{LockGrant, local_machine_id, machine_uid};
use crate::message::{TransferRecord, now_unix};
use crate::queue::transfer::requeue_into;
use crate::queue::{Queue, QueueManager, Shared};
use crate::storage::Batch;
use crate::{Priority, QueueError, Result};
use log::{debug, info, warn};
use std::time::{Duration, Instant};

pub const RECLAIM_OPERATION: &str = "reclaim_pending";

#[derive(Debug, Clone, PartialEq)]
pub struct ReclaimOptions {
    pub priority: Priority,
    /// Lock owner identity; the local machine id when unset
    pub machine_id: Option<String>,
    /// Time budget of one sweep and TTL of its lock; the priority default when unset
    pub window: Option<Duration>,
    /// Entries transferred more recently than this are left alone
    pub min_idle: Duration,
}

impl ReclaimOptions {
    pub fn new(priority: Priority) -> Self {
        Self {
            priority,
            machine_id: None,
            window: None,
            min_idle: Duration::ZERO,
        }
    }

    pub fn with_machine_id(mut self, machine_id: &str) -> Self {
        self.machine_id = Some(machine_id.to_string()).filter(|id| !id.is_empty());
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = Some(window).filter(|w| !w.is_zero());
        self
    }

    pub fn with_min_idle(mut self, min_idle: Duration) -> Self {
        self.min_idle = min_idle;
        self
    }

    pub fn effective_window(&self) -> Duration {
        self.window
            .unwrap_or_else(|| self.priority.default_reclaim_window())
    }
}

impl QueueManager {
    /// Sweeps the pending store of one priority class.
    ///
    /// Returns how many messages went back to their queues. Fails with
    /// [`QueueError::ClientLockFail`] while another owner runs the sweep.
    pub async fn reclaim_pending(&self, options: &ReclaimOptions) -> Result<usize> {
        reclaim(&self.shared, options).await
    }
}

impl Queue {
    /// Sweeps this queue's priority class, bounded by the queue's reclaim window.
    pub async fn reclaim_pending(&self, machine_id: Option<&str>) -> Result<usize> {
        let window = Duration::from_secs(self.trans_time().max(0) as u64);
        let mut options = ReclaimOptions::new(self.priority()).with_window(window);
        if let Some(machine_id) = machine_id {
            options = options.with_machine_id(machine_id);
        }
        reclaim(&self.shared, &options).await
    }
}

async fn reclaim(shared: &Shared, options: &ReclaimOptions) -> Result<usize> {
    let machine_id = options.machine_id.clone().unwrap_or_else(local_machine_id);
    let owner = machine_uid(&machine_id);
    let window = options.effective_window();
    let data_id = options.priority.as_u8().to_string();

    let token = match shared
        .lock
        .acquire_lock(RECLAIM_OPERATION, &data_id, owner, window)
        .await?
    {
        LockGrant::Acquired(token) => token,
        LockGrant::HeldBy(holder) => {
            debug!(
                "Reclaim of {} priority pending store is held by {}",
                options.priority, holder
            );
            return Err(QueueError::ClientLockFail {
                operation: RECLAIM_OPERATION.to_string(),
                holder,
            });
        }
    };

    let result = sweep(shared, options.priority, window, options.min_idle).await;

    if let Err(e) = shared.lock.release_lock(&token).await {
        warn!("Failed to release reclaim lock: {}", e);
    }

    if let Ok(count) = &result
        && *count > 0
    {
        info!(
            "Reclaimed {} pending messages of {} priority",
            count, options.priority
        );
    }
    result
}

async fn discard(shared: &Shared, table: &str, pending: &str, fp: &str) -> bool {
    let mut batch = Batch::new();
    batch.zrem(pending, fp).hdel(table, fp);
    match shared.store.exec(&batch).await {
        Ok(_) => true,
        Err(e) => {
            warn!("Failed to discard pending entry {}: {}", fp, e);
            false
        }
    }
}

async fn sweep(
    shared: &Shared,
    priority: Priority,
    window: Duration,
    min_idle: Duration,
) -> Result<usize> {
    let table = shared.keys.transfer_table(priority);
    let pending = shared.keys.transfer_queue(priority);

    if shared.store.hlen(&table).await? == 0 {
        return Ok(0);
    }

    let started = Instant::now();
    let mut reclaimed = 0;

    while started.elapsed() < window {
        let Some((fp, transferred_at)) = shared.store.zfirst(&pending).await? else {
            break;
        };

        // oldest first, so everything after is younger too
        if !min_idle.is_zero() && transferred_at > now_unix() as f64 - min_idle.as_secs_f64() {
            break;
        }

        let record = shared
            .store
            .hget(&table, &fp)
            .await?
            .and_then(|raw| TransferRecord::from_json(&raw));

        let Some(record) = record else {
            debug!("Discarding pending entry {} without a record", fp);
            if !discard(shared, &table, &pending, &fp).await {
                break;
            }
            continue;
        };

        let Some(descriptor) = shared.registry.fetch_descriptor(&record.queue_name).await? else {
            debug!(
                "Discarding pending entry {} of deleted queue {}",
                fp, record.queue_name
            );
            if !discard(shared, &table, &pending, &fp).await {
                break;
            }
            continue;
        };

        if record.envelope.is_expired() {
            debug!("Discarding expired pending entry {}", fp);
            if !discard(shared, &table, &pending, &fp).await {
                break;
            }
            continue;
        }

        let mut batch = Batch::new();
        batch
            .push(requeue_into(&descriptor, &record.envelope))
            .zrem(&pending, &fp)
            .hdel(&table, &fp);

        match shared.store.exec(&batch).await {
            Ok(_) => reclaimed += 1,
            Err(e) => {
                warn!("Failed to requeue pending entry {}: {}", fp, e);
                break;
            }
        }
    }

    Ok(reclaimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{self, Envelope, Payload};
    use crate::storage::{MemoryStore, Store};
    use crate::{ErrorKind, QueueOptions};
    use serde_json::json;
    use std::sync::Arc;

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn options() -> ReclaimOptions {
        ReclaimOptions::new(Priority::Normal).with_machine_id("host-a")
    }

    #[tokio::test]
    async fn empty_pending_store_reclaims_nothing() {
        let manager = QueueManager::new(Arc::new(MemoryStore::new()));
        assert_eq!(manager.reclaim_pending(&options()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unconfirmed_messages_return_to_their_queue() {
        let store = MemoryStore::new();
        let manager = QueueManager::new(Arc::new(store.clone()));
        let q = manager.new_queue(QueueOptions::new("Q")).await.unwrap();

        q.push(payload(json!({"a": 1})), 0).await.unwrap();
        q.push(payload(json!({"a": 2})), 0).await.unwrap();
        q.shift().await.unwrap().unwrap();
        q.shift().await.unwrap().unwrap();
        assert_eq!(q.len().await.unwrap(), 0);

        assert_eq!(manager.reclaim_pending(&options()).await.unwrap(), 2);
        assert_eq!(q.len().await.unwrap(), 2);
        assert_eq!(q.pending_len().await.unwrap(), 0);

        // transfer order is kept
        assert_eq!(q.shift().await.unwrap().unwrap()["a"], 1);
    }

    #[tokio::test]
    async fn other_priority_class_is_untouched() {
        let store = MemoryStore::new();
        let manager = QueueManager::new(Arc::new(store.clone()));
        let q = manager
            .new_queue(QueueOptions::new("urgent").priority(Priority::High))
            .await
            .unwrap();

        q.push(payload(json!({"a": 1})), 0).await.unwrap();
        q.shift().await.unwrap().unwrap();

        assert_eq!(manager.reclaim_pending(&options()).await.unwrap(), 0);
        assert_eq!(q.pending_len().await.unwrap(), 1);

        let high = ReclaimOptions::new(Priority::High).with_machine_id("host-a");
        assert_eq!(manager.reclaim_pending(&high).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn young_entries_wait_for_min_idle() {
        let store = MemoryStore::new();
        let manager = QueueManager::new(Arc::new(store.clone()));
        let q = manager.new_queue(QueueOptions::new("Q")).await.unwrap();

        q.push(payload(json!({"a": 1})), 0).await.unwrap();
        q.shift().await.unwrap().unwrap();

        let patient = options().with_min_idle(Duration::from_secs(600));
        assert_eq!(manager.reclaim_pending(&patient).await.unwrap(), 0);
        assert_eq!(q.pending_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_entries_are_discarded() {
        let store = MemoryStore::new();
        let manager = QueueManager::new(Arc::new(store.clone()));
        let q = manager.new_queue(QueueOptions::new("Q")).await.unwrap();
        let keys = manager.keys().clone();
        let table = keys.transfer_table(Priority::Normal);
        let pending = keys.transfer_queue(Priority::Normal);

        // expired message
        let expired = Envelope {
            expire_at: now_unix() - 5,
            ..message::wrap(payload(json!({"old": true})), 0, 0)
        };
        let record = TransferRecord::new("Q", expired);
        let mut batch = Batch::new();
        batch
            .zadd(&pending, 1.0, record.fingerprint())
            .hset(&table, record.fingerprint(), record.to_json());
        // queue no longer registered
        let orphan = TransferRecord::new("gone", message::wrap(payload(json!({"x": 1})), 0, 0));
        batch
            .zadd(&pending, 2.0, orphan.fingerprint())
            .hset(&table, orphan.fingerprint(), orphan.to_json());
        // corrupt record
        batch.zadd(&pending, 3.0, "junk").hset(&table, "junk", "{");
        // set entry without a record
        batch.zadd(&pending, 4.0, "lonely");
        store.exec(&batch).await.unwrap();

        assert_eq!(manager.reclaim_pending(&options()).await.unwrap(), 0);
        assert_eq!(q.len().await.unwrap(), 0);
        assert_eq!(q.pending_len().await.unwrap(), 0);
        assert_eq!(store.hlen(&table).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deleted_queue_is_not_recreated() {
        let store = MemoryStore::new();
        let manager = QueueManager::new(Arc::new(store.clone()));
        let q = manager.new_queue(QueueOptions::new("Q")).await.unwrap();

        q.push(payload(json!({"a": 1})), 0).await.unwrap();
        q.shift().await.unwrap().unwrap();
        assert!(manager.delete("Q").await.unwrap());

        assert_eq!(manager.reclaim_pending(&options()).await.unwrap(), 0);
        assert_eq!(q.pending_len().await.unwrap(), 0);
        assert_eq!(store.llen(q.key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_sweep_is_refused() {
        let store = MemoryStore::new();
        let manager = QueueManager::new(Arc::new(store.clone()));
        let q = manager.new_queue(QueueOptions::new("Q")).await.unwrap();
        q.push(payload(json!({"a": 1})), 0).await.unwrap();
        q.shift().await.unwrap().unwrap();

        let lock = manager.lock();
        let grant = lock
            .acquire_lock(RECLAIM_OPERATION, "0", machine_uid("host-b"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(grant.is_acquired());

        let err = manager.reclaim_pending(&options()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientLockFail);
        assert_eq!(q.pending_len().await.unwrap(), 1);

        lock.force_release_lock(RECLAIM_OPERATION, "0").await.unwrap();
        assert_eq!(manager.reclaim_pending(&options()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_requeue_leaves_entry_pending() {
        let store = MemoryStore::new();
        let manager = QueueManager::new(Arc::new(store.clone()));
        let q = manager.new_queue(QueueOptions::new("Q")).await.unwrap();
        q.push(payload(json!({"a": 1})), 0).await.unwrap();
        q.shift().await.unwrap().unwrap();

        store.fail_next_batches(1);
        assert_eq!(manager.reclaim_pending(&options()).await.unwrap(), 0);
        assert_eq!(q.pending_len().await.unwrap(), 1);
        assert_eq!(q.len().await.unwrap(), 0);

        // lock was released despite the failure
        assert_eq!(manager.reclaim_pending(&options()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn queue_level_sweep() {
        let manager = QueueManager::new(Arc::new(MemoryStore::new()));
        let q = manager
            .new_queue(QueueOptions::new("Q").trans_time(30))
            .await
            .unwrap();
        q.push(payload(json!({"a": 1})), 0).await.unwrap();
        q.shift().await.unwrap().unwrap();

        assert_eq!(q.reclaim_pending(Some("host-a")).await.unwrap(), 1);
        assert_eq!(q.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lock_is_released_after_sweep() {
        let store = MemoryStore::new();
        let manager = QueueManager::new(Arc::new(store.clone()));
        manager.reclaim_pending(&options()).await.unwrap();

        let key = manager.keys().lock(RECLAIM_OPERATION, "0");
        assert_eq!(store.get(&key).await.unwrap(), None);
    }
}
