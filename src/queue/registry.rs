//! Queue name -> queue key registry, mirrored in a process-local cache.
//!
//! The store is the source of truth. The cache is refreshed wholesale when
//! a full listing is needed and filled one entry at a time on lookups and
//! registrations, so a stale cache only costs an extra round-trip.

use crate::config::Priority;
use crate::keys::KeySpace;
use crate::storage::Store;
use crate::Result;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub queue_name: String,
    pub queue_key: String,
    pub is_sort: bool,
    pub priority: Priority,
    /// Message lifetime configured by the queue handle; 0 when read from the registry
    pub expire_secs: i64,
}

impl QueueDescriptor {
    pub fn from_key(keys: &KeySpace, queue_key: &str) -> Option<Self> {
        let (queue_name, is_sort, priority) = keys.parse_queue(queue_key)?;
        Some(Self {
            queue_name,
            queue_key: queue_key.to_string(),
            is_sort,
            priority,
            expire_secs: 0,
        })
    }
}

#[derive(Default)]
struct Cache {
    entries: HashMap<String, String>,
    /// Entries mirror the whole registry as of the last full refresh
    complete: bool,
}

pub struct Registry {
    store: Arc<dyn Store>,
    keys: KeySpace,
    cache: RwLock<Cache>,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>, keys: KeySpace) -> Self {
        Self {
            store,
            keys,
            cache: RwLock::new(Cache::default()),
        }
    }

    fn cached(&self, queue_name: &str) -> Option<String> {
        self.cache
            .read()
            .ok()
            .and_then(|c| c.entries.get(queue_name).cloned())
    }

    fn remember(&self, queue_name: &str, queue_key: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache
                .entries
                .insert(queue_name.to_string(), queue_key.to_string());
        }
    }

    pub async fn queues(&self, read_cache: bool) -> Result<Vec<String>> {
        if read_cache
            && let Ok(cache) = self.cache.read()
            && cache.complete
            && !cache.entries.is_empty()
        {
            let mut names: Vec<String> = cache.entries.keys().cloned().collect();
            names.sort();
            return Ok(names);
        }

        let all = self.store.hgetall(&self.keys.registry()).await?;
        debug!("Refreshed queue registry cache with {} queues", all.len());

        let mut names: Vec<String> = all.keys().cloned().collect();
        names.sort();

        if let Ok(mut cache) = self.cache.write() {
            cache.entries = all;
            cache.complete = true;
        }

        Ok(names)
    }

    pub async fn count_queues(&self, read_cache: bool) -> Result<usize> {
        Ok(self.queues(read_cache).await?.len())
    }

    pub async fn queue_exists(&self, queue_name: &str) -> Result<bool> {
        if queue_name.is_empty() {
            return Ok(false);
        }
        Ok(self.queue_key(queue_name).await?.is_some())
    }

    pub async fn queue_key(&self, queue_name: &str) -> Result<Option<String>> {
        if let Some(key) = self.cached(queue_name) {
            return Ok(Some(key));
        }
        self.fetch_queue_key(queue_name).await
    }

    /// Bypasses the cache.
    pub async fn fetch_queue_key(&self, queue_name: &str) -> Result<Option<String>> {
        let key = self
            .store
            .hget(&self.keys.registry(), queue_name)
            .await?
            .filter(|k| !k.is_empty());

        match &key {
            Some(key) => self.remember(queue_name, key),
            None => self.evict(queue_name),
        }

        Ok(key)
    }

    pub async fn descriptor(&self, queue_name: &str) -> Result<Option<QueueDescriptor>> {
        Ok(self
            .queue_key(queue_name)
            .await?
            .and_then(|key| QueueDescriptor::from_key(&self.keys, &key)))
    }

    pub async fn fetch_descriptor(&self, queue_name: &str) -> Result<Option<QueueDescriptor>> {
        Ok(self
            .fetch_queue_key(queue_name)
            .await?
            .and_then(|key| QueueDescriptor::from_key(&self.keys, &key)))
    }

    /// Set-if-absent registration. `false` means the name is already taken.
    pub async fn add_queue_name(
        &self,
        queue_name: &str,
        is_sort: bool,
        priority: Priority,
    ) -> Result<bool> {
        let queue_key = self.keys.queue(queue_name, is_sort, priority);
        let created = self
            .store
            .hset_nx(&self.keys.registry(), queue_name, &queue_key)
            .await?;

        if created {
            self.remember(queue_name, &queue_key);
        }

        Ok(created)
    }

    pub fn evict(&self, queue_name: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.entries.remove(queue_name);
        }
    }

    pub fn reset_cache(&self) {
        if let Ok(mut cache) = self.cache.write() {
            *cache = Cache::default();
        }
    }
}
