use crate::storage::{Batch, Command};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command error: {0}")]
    Command(String),

    #[error("wrong type for key {0}")]
    WrongType(String),

    #[error("batch aborted: {0}")]
    BatchAborted(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<redis::RedisError> for StoreError {
    fn from(value: redis::RedisError) -> Self {
        if value.is_io_error() || value.is_connection_dropped() || value.is_connection_refusal() {
            StoreError::Connection(value.to_string())
        } else {
            StoreError::Command(value.to_string())
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Liveness probe
    async fn ping(&self) -> StoreResult<()>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hmget(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>>;

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Returns false when the field already exists
    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> StoreResult<bool>;

    async fn hlen(&self, key: &str) -> StoreResult<u64>;

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>>;

    async fn rpop(&self, key: &str) -> StoreResult<Option<String>>;

    async fn llen(&self, key: &str) -> StoreResult<u64>;

    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    /// Lowest-scored member with its score
    async fn zfirst(&self, key: &str) -> StoreResult<Option<(String, f64)>>;

    /// Highest-scored member with its score
    async fn zlast(&self, key: &str) -> StoreResult<Option<(String, f64)>>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// SET key value NX EX ttl
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool>;

    /// Overwrite `key` only while it still holds `expected`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl_secs: u64,
    ) -> StoreResult<bool>;

    /// Delete `key` only while it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Apply every command or none of them. One integer reply per command.
    async fn exec(&self, batch: &Batch) -> StoreResult<Vec<i64>>;

    /// Like [`exec`](Store::exec), but only while `member` is still in the
    /// sorted set `key`. `None` when it is gone and nothing was written.
    async fn exec_if_member(
        &self,
        key: &str,
        member: &str,
        batch: &Batch,
    ) -> StoreResult<Option<Vec<i64>>>;

    async fn run(&self, command: Command) -> StoreResult<i64> {
        let replies = self.exec(&Batch::from(command)).await?;
        replies
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Command("empty reply".to_string()))
    }
}
