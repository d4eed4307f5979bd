//! Advisory locks over an `(operation, data id)` pair.
//!
//! The stored value is `"{owner}|{expire_at}"`. Expiry is cooperative: a
//! record past its `expire_at` may be taken over by anyone, and the store
//! TTL only cleans up after crashed owners.

use crate::keys::KeySpace;
use crate::message::now_unix;
use crate::storage::{Command, Store};
use crate::{QueueError, Result};
use log::debug;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// Proof of ownership, needed to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub operation: String,
    pub data_id: String,
    pub owner: i64,
    value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockGrant {
    Acquired(LockToken),
    /// Held by another owner (0 when the owner could not be read)
    HeldBy(i64),
}

impl LockGrant {
    /// Owner uid when acquired, `-abs(holder)` otherwise.
    pub fn code(&self) -> i64 {
        match self {
            LockGrant::Acquired(token) => token.owner,
            LockGrant::HeldBy(holder) => -holder.abs(),
        }
    }

    pub fn is_acquired(&self) -> bool {
        matches!(self, LockGrant::Acquired(_))
    }
}

fn parse_record(raw: &str) -> Option<(i64, i64)> {
    let (owner, expire_at) = raw.split_once('|')?;
    Some((owner.trim().parse().ok()?, expire_at.trim().parse().ok()?))
}

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn Store>,
    keys: KeySpace,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn Store>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    pub async fn acquire_lock(
        &self,
        operation: &str,
        data_id: &str,
        owner: i64,
        ttl: Duration,
    ) -> Result<LockGrant> {
        if operation.is_empty() || data_id.is_empty() || owner <= 0 {
            return Err(QueueError::QueueOperationFailed(format!(
                "invalid lock request {}:{} by {}",
                operation, data_id, owner
            )));
        }

        let ttl = if ttl.is_zero() { DEFAULT_LOCK_TTL } else { ttl };
        let ttl_secs = ttl.as_secs().max(1);
        let now = now_unix();
        let key = self.keys.lock(operation, data_id);
        let value = format!("{}|{}", owner, now + ttl_secs as i64);

        let acquired = |value: String| {
            LockGrant::Acquired(LockToken {
                operation: operation.to_string(),
                data_id: data_id.to_string(),
                owner,
                value,
            })
        };

        if self.store.set_nx_ex(&key, &value, ttl_secs).await? {
            return Ok(acquired(value));
        }

        let current = match self.store.get(&key).await? {
            Some(raw) => raw,
            // released between our two calls
            None => {
                return if self.store.set_nx_ex(&key, &value, ttl_secs).await? {
                    Ok(acquired(value))
                } else {
                    Ok(LockGrant::HeldBy(0))
                };
            }
        };

        let takeover = match parse_record(&current) {
            None | Some((0, _)) => Some(0),
            Some((holder, expire_at)) if holder == owner || now > expire_at => Some(holder),
            Some(_) => None,
        };

        match takeover {
            Some(previous) => {
                if self
                    .store
                    .compare_and_swap(&key, &current, &value, ttl_secs)
                    .await?
                {
                    debug!("Lock {} taken over from {}", key, previous);
                    Ok(acquired(value))
                } else {
                    Ok(LockGrant::HeldBy(previous))
                }
            }
            None => {
                let holder = parse_record(&current).map(|(h, _)| h).unwrap_or(0);
                Ok(LockGrant::HeldBy(holder))
            }
        }
    }

    /// Deletes the lock only while `token` still owns it.
    pub async fn release_lock(&self, token: &LockToken) -> Result<bool> {
        let key = self.keys.lock(&token.operation, &token.data_id);
        Ok(self.store.compare_and_delete(&key, &token.value).await?)
    }

    /// Deletes the lock whoever holds it.
    pub async fn force_release_lock(&self, operation: &str, data_id: &str) -> Result<bool> {
        let key = self.keys.lock(operation, data_id);
        Ok(self.store.run(Command::Del { key }).await? > 0)
    }
}

/// Identifier of this host: `/etc/machine-id` when present, else the hostname.
pub fn local_machine_id() -> String {
    std::fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .or_else(|| {
            hostname::get()
                .ok()
                .map(|h| h.to_string_lossy().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

/// Positive 63-bit owner uid derived from a machine identifier.
pub fn machine_uid(machine_id: &str) -> i64 {
    let digest = Sha256::digest(machine_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let uid = (u64::from_be_bytes(bytes) & i64::MAX as u64) as i64;
    uid.max(1)
}
