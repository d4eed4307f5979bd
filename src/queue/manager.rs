use crate::config::{DEFAULT_TTL_SECS, QueueOptions};
use crate::connection::ConnectionManager;
use crate::keys::KeySpace;
use crate::lock::DistributedLock;
use crate::queue::{Queue, QueueDescriptor, Registry, Shared};
use crate::storage::Store;
use crate::{Priority, QueueError, Result};
use log::{debug, info};
use std::sync::Arc;

/// Entry point: creates queue handles and runs registry-wide operations.
///
/// Build one per connection and create every queue through it: handles share
/// its registry cache and lock. Clones share the same state.
#[derive(Clone)]
pub struct QueueManager {
    pub(super) shared: Arc<Shared>,
    conn_name: String,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("prefix", &self.shared.keys.prefix())
            .field("conn_name", &self.conn_name)
            .finish()
    }
}

impl QueueManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_keys(store, KeySpace::default())
    }

    pub fn with_keys(store: Arc<dyn Store>, keys: KeySpace) -> Self {
        Self {
            shared: Arc::new(Shared::new(store, keys)),
            conn_name: String::new(),
        }
    }

    /// Manager over the connection registered as `conn_name` ("" = default).
    pub async fn connect(connections: &ConnectionManager, conn_name: &str) -> Result<Self> {
        let conn_name = conn_name.trim();
        let store = connections.get_named_connection(conn_name).await?;
        Ok(Self {
            conn_name: conn_name.to_string(),
            ..Self::new(Arc::new(store))
        })
    }

    /// Connection name this manager was connected through, "" for the default.
    pub fn conn_name(&self) -> &str {
        &self.conn_name
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.shared.store
    }

    pub fn keys(&self) -> &KeySpace {
        &self.shared.keys
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.shared.lock
    }

    /// Registers the queue if needed and returns a handle to it.
    ///
    /// An existing queue must have the same ordering and priority, otherwise
    /// [`QueueError::QueueExistsTypeConflict`] is returned. `options.conn_name`
    /// must name this manager's connection; connect another manager for a
    /// different one.
    pub async fn new_queue(&self, options: QueueOptions) -> Result<Queue> {
        let options = options.normalized();
        let name = options.queue_name.as_str();
        if name.is_empty() {
            return Err(QueueError::QueueNameEmpty);
        }
        if options.conn_name != self.conn_name {
            return Err(QueueError::ClientNotExist(options.conn_name.clone()));
        }

        let registry = &self.shared.registry;
        let expected = self.shared.keys.queue(name, options.is_sort, options.priority);

        if registry
            .add_queue_name(name, options.is_sort, options.priority)
            .await?
        {
            info!(
                "Created queue {} (sorted: {}, priority: {})",
                name, options.is_sort, options.priority
            );
        } else {
            let existing = registry
                .fetch_queue_key(name)
                .await?
                .ok_or_else(|| QueueError::QueueInfoFetchFailed(name.to_string()))?;

            if existing != expected {
                return Err(QueueError::QueueExistsTypeConflict {
                    name: name.to_string(),
                });
            }
            debug!("Attached to existing queue {}", name);
        }

        let descriptor = QueueDescriptor {
            queue_name: name.to_string(),
            queue_key: expected,
            is_sort: options.is_sort,
            priority: options.priority,
            expire_secs: options.expire,
        };

        Ok(Queue::new(self.shared.clone(), descriptor, options.trans_time))
    }

    /// Handle to a registered queue, with the stored ordering and priority.
    /// Messages added through it never expire.
    pub async fn queue(&self, queue_name: &str) -> Result<Queue> {
        let queue_name = queue_name.trim();
        if queue_name.is_empty() {
            return Err(QueueError::QueueNameEmpty);
        }

        let descriptor = self
            .shared
            .registry
            .descriptor(queue_name)
            .await?
            .ok_or_else(|| QueueError::QueueNotExist(queue_name.to_string()))?;

        Ok(Queue::new(self.shared.clone(), descriptor, DEFAULT_TTL_SECS))
    }

    pub async fn queues(&self, read_cache: bool) -> Result<Vec<String>> {
        self.shared.registry.queues(read_cache).await
    }

    pub async fn count_queues(&self, read_cache: bool) -> Result<usize> {
        self.shared.registry.count_queues(read_cache).await
    }

    pub async fn queue_exists(&self, queue_name: &str) -> Result<bool> {
        self.shared.registry.queue_exists(queue_name.trim()).await
    }

    pub async fn queue_key(&self, queue_name: &str) -> Result<Option<String>> {
        self.shared.registry.queue_key(queue_name.trim()).await
    }

    pub async fn descriptor(&self, queue_name: &str) -> Result<Option<QueueDescriptor>> {
        self.shared.registry.descriptor(queue_name.trim()).await
    }

    pub async fn len(&self, queue_name: &str) -> Result<u64> {
        self.queue(queue_name).await?.len().await
    }

    pub async fn clear(&self, queue_name: &str) -> Result<bool> {
        self.queue(queue_name).await?.clear().await
    }

    pub async fn delete(&self, queue_name: &str) -> Result<bool> {
        self.queue(queue_name).await?.delete().await
    }

    pub async fn pending_len(&self, priority: Priority) -> Result<u64> {
        Ok(self
            .shared
            .store
            .zcard(&self.shared.keys.transfer_queue(priority))
            .await?)
    }

    /// Forgets cached registry entries; the next lookup goes to the store.
    pub fn reset_cache(&self) {
        self.shared.registry.reset_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::ErrorKind;
    use serde_json::json;

    fn manager() -> QueueManager {
        QueueManager::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn new_queue_registers_once() {
        let manager = manager();
        let q = manager
            .new_queue(QueueOptions::new("  mail ").expire(-1).trans_time(0))
            .await
            .unwrap();

        assert_eq!(q.name(), "mail");
        assert_eq!(q.key(), "Redisque-RedisQueue|mail|nosort|0");
        assert_eq!(q.expire_secs(), DEFAULT_TTL_SECS);
        assert_eq!(q.trans_time(), DEFAULT_TTL_SECS);

        // same shape attaches
        manager.new_queue(QueueOptions::new("mail")).await.unwrap();
        assert_eq!(manager.count_queues(false).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn conflicting_shape_is_rejected() {
        let manager = manager();
        manager.new_queue(QueueOptions::new("mail")).await.unwrap();

        let err = manager
            .new_queue(QueueOptions::new("mail").sorted(true))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueExistsTypeConflict);

        let err = manager
            .new_queue(QueueOptions::new("mail").priority(Priority::High))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueExistsTypeConflict);
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let manager = manager();
        let err = manager.new_queue(QueueOptions::new("   ")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueNameEmpty);
        assert_eq!(manager.queue("").await.unwrap_err().kind(), ErrorKind::QueueNameEmpty);
    }

    #[tokio::test]
    async fn operations_by_name() {
        let manager = manager();
        let q = manager
            .new_queue(QueueOptions::new("ranked").sorted(true))
            .await
            .unwrap();
        let msg = match json!({"a": 1}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        q.add(msg, 3).await.unwrap();

        assert_eq!(manager.len("ranked").await.unwrap(), 1);
        let reopened = manager.queue("ranked").await.unwrap();
        assert!(reopened.is_sort());
        assert_eq!(reopened.priority(), Priority::Normal);

        assert!(manager.clear("ranked").await.unwrap());
        assert_eq!(manager.len("ranked").await.unwrap(), 0);

        assert!(manager.delete("ranked").await.unwrap());
        let err = manager.len("ranked").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueNotExist);
        assert_eq!(manager.queue_key("ranked").await.unwrap(), None);
    }

    #[tokio::test]
    async fn managers_share_the_registry_through_the_store() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let a = QueueManager::new(store.clone());
        let b = QueueManager::new(store);

        a.new_queue(QueueOptions::new("one")).await.unwrap();
        assert_eq!(b.queues(true).await.unwrap(), vec!["one"]);

        a.new_queue(QueueOptions::new("two")).await.unwrap();
        assert_eq!(b.count_queues(true).await.unwrap(), 1);
        b.reset_cache();
        assert_eq!(b.count_queues(true).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn queue_handles_share_the_manager_state() {
        let manager = manager();
        let first = manager.new_queue(QueueOptions::new("one")).await.unwrap();
        let second = manager.clone().new_queue(QueueOptions::new("two")).await.unwrap();
        assert!(Arc::ptr_eq(&first.shared, &manager.shared));
        assert!(Arc::ptr_eq(&second.shared, &manager.shared));

        // dropping a queue through one handle is seen through the manager
        assert_eq!(manager.count_queues(false).await.unwrap(), 2);
        assert!(first.delete().await.unwrap());
        assert!(!manager.queue_exists("one").await.unwrap());
    }

    #[tokio::test]
    async fn queue_options_must_match_the_connection() {
        let manager = manager();
        assert_eq!(manager.conn_name(), "");

        let err = manager
            .new_queue(QueueOptions::new("mail").conn_name("billing"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientNotExist);
        assert!(!manager.queue_exists("mail").await.unwrap());

        manager
            .new_queue(QueueOptions::new("mail").conn_name("  "))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn prefixes_isolate_managers() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let a = QueueManager::with_keys(store.clone(), KeySpace::new("app-a"));
        let b = QueueManager::with_keys(store, KeySpace::new("app-b"));

        a.new_queue(QueueOptions::new("jobs")).await.unwrap();
        assert!(!b.queue_exists("jobs").await.unwrap());
        assert_eq!(b.pending_len(Priority::Normal).await.unwrap(), 0);
    }
}
