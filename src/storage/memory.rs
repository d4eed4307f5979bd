//! In-process store for tests and embedding.
//!
//! Mirrors the subset of Redis semantics the queue relies on: typed keys,
//! sorted sets ordered by (score, member), string TTLs and all-or-nothing
//! batches. Faults can be injected to exercise the compensation paths.

use crate::storage::{Batch, Command, Store, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use time::OffsetDateTime;

#[derive(Debug, Clone)]
enum Value {
    Str { value: String, expire_at: Option<i64> },
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Default, Clone)]
struct Keyspace {
    data: HashMap<String, Value>,
}

impl Keyspace {
    fn purge_expired(&mut self, key: &str) {
        let expired = matches!(
            self.data.get(key),
            Some(Value::Str { expire_at: Some(at), .. }) if *at <= now_unix()
        );
        if expired {
            self.data.remove(key);
        }
    }

    fn hash(&self, key: &str) -> StoreResult<Option<&HashMap<String, String>>> {
        match self.data.get(key) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(Some(h)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn hash_mut(&mut self, key: &str) -> StoreResult<&mut HashMap<String, String>> {
        let entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(HashMap::new()));
        match entry {
            Value::Hash(h) => Ok(h),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn list(&self, key: &str) -> StoreResult<Option<&VecDeque<String>>> {
        match self.data.get(key) {
            None => Ok(None),
            Some(Value::List(l)) => Ok(Some(l)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn list_mut(&mut self, key: &str) -> StoreResult<&mut VecDeque<String>> {
        let entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()));
        match entry {
            Value::List(l) => Ok(l),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn zset(&self, key: &str) -> StoreResult<Option<&HashMap<String, f64>>> {
        match self.data.get(key) {
            None => Ok(None),
            Some(Value::ZSet(z)) => Ok(Some(z)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn zset_mut(&mut self, key: &str) -> StoreResult<&mut HashMap<String, f64>> {
        let entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::ZSet(HashMap::new()));
        match entry {
            Value::ZSet(z) => Ok(z),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn string(&mut self, key: &str) -> StoreResult<Option<String>> {
        self.purge_expired(key);
        match self.data.get(key) {
            None => Ok(None),
            Some(Value::Str { value, .. }) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    /// Redis drops containers once they become empty.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.data.get(key) {
            Some(Value::Hash(h)) => h.is_empty(),
            Some(Value::List(l)) => l.is_empty(),
            Some(Value::ZSet(z)) => z.is_empty(),
            _ => false,
        };
        if empty {
            self.data.remove(key);
        }
    }

    fn apply(&mut self, command: &Command) -> StoreResult<i64> {
        let reply = match command {
            Command::LPush { key, value } => {
                let list = self.list_mut(key)?;
                list.push_front(value.clone());
                list.len() as i64
            }
            Command::RPush { key, value } => {
                let list = self.list_mut(key)?;
                list.push_back(value.clone());
                list.len() as i64
            }
            Command::ZAdd { key, score, member } => {
                let zset = self.zset_mut(key)?;
                match zset.insert(member.clone(), *score) {
                    Some(_) => 0,
                    None => 1,
                }
            }
            Command::ZRem { key, member } => {
                if self.zset(key)?.is_none() {
                    return Ok(0);
                }
                let removed = self.zset_mut(key)?.remove(member).is_some() as i64;
                self.drop_if_empty(key);
                removed
            }
            Command::HSet { key, field, value } => {
                let hash = self.hash_mut(key)?;
                match hash.insert(field.clone(), value.clone()) {
                    Some(_) => 0,
                    None => 1,
                }
            }
            Command::HDel { key, field } => {
                if self.hash(key)?.is_none() {
                    return Ok(0);
                }
                let removed = self.hash_mut(key)?.remove(field).is_some() as i64;
                self.drop_if_empty(key);
                removed
            }
            Command::Del { key } => {
                self.purge_expired(key);
                self.data.remove(key).is_some() as i64
            }
        };

        Ok(reply)
    }

    /// Applies the whole batch to a copy and swaps it in only if every command succeeded.
    fn apply_all(&mut self, batch: &Batch) -> StoreResult<Vec<i64>> {
        let mut staged = self.clone();
        let replies = batch
            .commands()
            .iter()
            .map(|command| staged.apply(command))
            .collect::<StoreResult<Vec<i64>>>()
            .map_err(|e| StoreError::BatchAborted(e.to_string()))?;
        *self = staged;
        Ok(replies)
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn ordered(zset: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut entries: Vec<(String, f64)> = zset.iter().map(|(m, s)| (m.clone(), *s)).collect();
    entries.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    entries
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Keyspace>>,
    failing_batches: Arc<AtomicUsize>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` calls to [`Store::exec`] fail without applying anything.
    pub fn fail_next_batches(&self, count: usize) {
        self.failing_batches.store(count, Ordering::SeqCst);
    }

    /// While offline every call fails with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live keys
    pub fn key_count(&self) -> usize {
        self.read().map(|ks| ks.data.len()).unwrap_or(0)
    }

    pub fn flush(&self) {
        if let Ok(mut ks) = self.write() {
            ks.data.clear();
        }
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Keyspace>> {
        self.check_online()?;
        self.inner
            .read()
            .map_err(|_| StoreError::Connection("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Keyspace>> {
        self.check_online()?;
        self.inner
            .write()
            .map_err(|_| StoreError::Connection("memory store lock poisoned".to_string()))
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.check_online()
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let ks = self.read()?;
        Ok(ks.hash(key)?.and_then(|h| h.get(field).cloned()))
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>> {
        let ks = self.read()?;
        let hash = ks.hash(key)?;
        Ok(fields
            .iter()
            .map(|f| hash.and_then(|h| h.get(f).cloned()))
            .collect())
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let ks = self.read()?;
        Ok(ks.hash(key)?.cloned().unwrap_or_default())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> StoreResult<bool> {
        let mut ks = self.write()?;
        let hash = ks.hash_mut(key)?;
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hlen(&self, key: &str) -> StoreResult<u64> {
        let ks = self.read()?;
        Ok(ks.hash(key)?.map(|h| h.len() as u64).unwrap_or(0))
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut ks = self.write()?;
        if ks.list(key)?.is_none() {
            return Ok(None);
        }
        let value = ks.list_mut(key)?.pop_front();
        ks.drop_if_empty(key);
        Ok(value)
    }

    async fn rpop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut ks = self.write()?;
        if ks.list(key)?.is_none() {
            return Ok(None);
        }
        let value = ks.list_mut(key)?.pop_back();
        ks.drop_if_empty(key);
        Ok(value)
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        let ks = self.read()?;
        Ok(ks.list(key)?.map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let ks = self.read()?;
        Ok(ks.zset(key)?.map(|z| z.len() as u64).unwrap_or(0))
    }

    async fn zfirst(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
        let ks = self.read()?;
        Ok(ks.zset(key)?.and_then(|z| ordered(z).into_iter().next()))
    }

    async fn zlast(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
        let ks = self.read()?;
        Ok(ks.zset(key)?.and_then(|z| ordered(z).into_iter().next_back()))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut ks = self.write()?;
        ks.string(key)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool> {
        let mut ks = self.write()?;
        ks.purge_expired(key);
        if ks.data.contains_key(key) {
            return Ok(false);
        }
        ks.data.insert(
            key.to_string(),
            Value::Str {
                value: value.to_string(),
                expire_at: Some(now_unix() + ttl_secs.max(1) as i64),
            },
        );
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl_secs: u64,
    ) -> StoreResult<bool> {
        let mut ks = self.write()?;
        if ks.string(key)?.as_deref() != Some(expected) {
            return Ok(false);
        }
        ks.data.insert(
            key.to_string(),
            Value::Str {
                value: value.to_string(),
                expire_at: Some(now_unix() + ttl_secs.max(1) as i64),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut ks = self.write()?;
        if ks.string(key)?.as_deref() != Some(expected) {
            return Ok(false);
        }
        ks.data.remove(key);
        Ok(true)
    }

    async fn exec(&self, batch: &Batch) -> StoreResult<Vec<i64>> {
        self.check_online()?;
        if self.take_injected_failure() {
            return Err(StoreError::BatchAborted("injected failure".to_string()));
        }

        let mut ks = self.write()?;
        ks.apply_all(batch)
    }

    async fn exec_if_member(
        &self,
        key: &str,
        member: &str,
        batch: &Batch,
    ) -> StoreResult<Option<Vec<i64>>> {
        self.check_online()?;
        if self.take_injected_failure() {
            return Err(StoreError::BatchAborted("injected failure".to_string()));
        }

        let mut ks = self.write()?;
        let present = ks
            .zset(key)
            .map_err(|e| StoreError::BatchAborted(e.to_string()))?
            .is_some_and(|z| z.contains_key(member));
        if !present {
            return Ok(None);
        }
        ks.apply_all(batch).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sorted_set_orders_by_score_then_member() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch.zadd("z", 2.0, "b").zadd("z", 1.0, "c").zadd("z", 2.0, "a");
        store.exec(&batch).await.unwrap();

        assert_eq!(store.zfirst("z").await.unwrap(), Some(("c".to_string(), 1.0)));
        assert_eq!(store.zlast("z").await.unwrap(), Some(("b".to_string(), 2.0)));
        assert_eq!(store.zcard("z").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn failed_batch_applies_nothing() {
        let store = MemoryStore::new();
        store.run(Command::RPush { key: "l".into(), value: "x".into() }).await.unwrap();

        // second command hits a list key with a hash op
        let mut batch = Batch::new();
        batch.rpush("l", "y").hset("l", "f", "v");
        assert!(store.exec(&batch).await.is_err());
        assert_eq!(store.llen("l").await.unwrap(), 1);

        store.fail_next_batches(1);
        let mut batch = Batch::new();
        batch.rpush("l", "z");
        assert!(matches!(store.exec(&batch).await, Err(StoreError::BatchAborted(_))));
        assert_eq!(store.exec(&batch).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn empty_containers_disappear() {
        let store = MemoryStore::new();
        store.run(Command::LPush { key: "l".into(), value: "x".into() }).await.unwrap();
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.rpop("l").await.unwrap().as_deref(), Some("x"));
        assert_eq!(store.key_count(), 0);
        assert_eq!(store.lpop("l").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_nx_and_compare_ops() {
        let store = MemoryStore::new();
        assert!(store.set_nx_ex("k", "1|10", 60).await.unwrap());
        assert!(!store.set_nx_ex("k", "2|10", 60).await.unwrap());
        assert!(!store.compare_and_swap("k", "2|10", "3|10", 60).await.unwrap());
        assert!(store.compare_and_swap("k", "1|10", "3|10", 60).await.unwrap());
        assert!(!store.compare_and_delete("k", "1|10").await.unwrap());
        assert!(store.compare_and_delete("k", "3|10").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn guarded_batch_needs_the_member() {
        let store = MemoryStore::new();
        store.run(Command::ZAdd { key: "z".into(), score: 1.0, member: "m".into() }).await.unwrap();

        let mut batch = Batch::new();
        batch.hset("h", "f", "v").zrem("z", "m");
        assert_eq!(store.exec_if_member("z", "m", &batch).await.unwrap(), Some(vec![1, 1]));
        assert_eq!(store.exec_if_member("z", "m", &batch).await.unwrap(), None);
        assert_eq!(store.hlen("h").await.unwrap(), 1);

        store.hset_nx("other", "x", "y").await.unwrap();
        let mut batch = Batch::new();
        batch.hset("h2", "f", "v");
        assert_eq!(store.exec_if_member("missing", "m", &batch).await.unwrap(), None);
        assert!(store.exec_if_member("other", "m", &batch).await.is_err());
        assert_eq!(store.hlen("h2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn offline_store_refuses_everything() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(matches!(store.ping().await, Err(StoreError::Connection(_))));
        assert!(store.hlen("h").await.is_err());
        store.set_offline(false);
        assert!(store.ping().await.is_ok());
    }
}
