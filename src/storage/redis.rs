use crate::storage::{Batch, Command, Store, StoreError, StoreResult};
use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::{AsyncCommands, Script};
use std::collections::HashMap;

const COMPARE_AND_SWAP: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
    return 1
end
return 0
"#;

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

// KEYS[1] guarded set, KEYS[2..] one per command.
// ARGV[1] guarded member, then per command: name, arg count, args.
const EXEC_IF_MEMBER: &str = r#"
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
    return false
end
local replies = {}
local pos = 2
for i = 2, #KEYS do
    local name = ARGV[pos]
    local count = tonumber(ARGV[pos + 1])
    local args = {}
    for j = 1, count do
        args[j] = ARGV[pos + 1 + j]
    end
    replies[#replies + 1] = redis.call(name, KEYS[i], unpack(args))
    pos = pos + 2 + count
end
return replies
"#;

/// A rejected write inside a batch aborts it; transport errors stay connection errors.
fn abort_on_command_error(err: redis::RedisError) -> StoreError {
    match StoreError::from(err) {
        StoreError::Command(msg) => StoreError::BatchAborted(msg),
        other => other,
    }
}

#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    session_id: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl RedisStore {
    /// Builds the pool; no round-trip happens until the first command.
    pub fn open(redis_url: &str, session_id: &str) -> StoreResult<Self> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            session_id: session_id.to_string(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn get_conn(&self) -> StoreResult<Connection> {
        self.pool.get().await.map_err(|e| {
            StoreError::Connection(format!("Failed to get Redis connection: {}", e))
        })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.get_conn().await?;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong.contains("PONG") {
            Ok(())
        } else {
            Err(StoreError::Connection(format!("unexpected ping reply: {}", pong)))
        }
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.get_conn().await?;
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.get_conn().await?;
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.get_conn().await?;
        let values: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(values)
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let created: bool = conn.hset_nx(key, field, value).await?;
        Ok(created)
    }

    async fn hlen(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.get_conn().await?;
        let len: u64 = conn.hlen(key).await?;
        Ok(len)
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.get_conn().await?;
        let value: Option<String> = conn.lpop(key, None).await?;
        Ok(value)
    }

    async fn rpop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.get_conn().await?;
        let value: Option<String> = conn.rpop(key, None).await?;
        Ok(value)
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.get_conn().await?;
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.get_conn().await?;
        let len: u64 = conn.zcard(key).await?;
        Ok(len)
    }

    async fn zfirst(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
        let mut conn = self.get_conn().await?;
        let entries: Vec<(String, f64)> = conn.zrange_withscores(key, 0, 0).await?;
        Ok(entries.into_iter().next())
    }

    async fn zlast(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
        let mut conn = self.get_conn().await?;
        let entries: Vec<(String, f64)> = conn.zrevrange_withscores(key, 0, 0).await?;
        Ok(entries.into_iter().next())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.get_conn().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl_secs: u64,
    ) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let swapped: i64 = Script::new(COMPARE_AND_SWAP)
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(ttl_secs.max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.get_conn().await?;
        let deleted: i64 = Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn exec_if_member(
        &self,
        key: &str,
        member: &str,
        batch: &Batch,
    ) -> StoreResult<Option<Vec<i64>>> {
        let mut conn = self.get_conn().await?;

        let script = Script::new(EXEC_IF_MEMBER);
        let mut invocation = script.key(key);
        invocation.arg(member);
        for command in batch.commands() {
            let args = command.args();
            invocation
                .key(command.key())
                .arg(command.name())
                .arg(args.len())
                .arg(args);
        }

        let replies: Option<Vec<i64>> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(abort_on_command_error)?;
        Ok(replies)
    }

    async fn exec(&self, batch: &Batch) -> StoreResult<Vec<i64>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.get_conn().await?;

        let mut pipe = redis::pipe();
        pipe.atomic();

        for command in batch.commands() {
            match command {
                Command::LPush { key, value } => pipe.lpush(key, value),
                Command::RPush { key, value } => pipe.rpush(key, value),
                Command::ZAdd { key, score, member } => pipe.zadd(key, member, *score),
                Command::ZRem { key, member } => pipe.zrem(key, member),
                Command::HSet { key, field, value } => pipe.hset(key, field, value),
                Command::HDel { key, field } => pipe.hdel(key, field),
                Command::Del { key } => pipe.del(key),
            };
        }

        let replies: Vec<i64> = pipe
            .query_async(&mut conn)
            .await
            .map_err(abort_on_command_error)?;

        Ok(replies)
    }
}
