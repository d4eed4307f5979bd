//! A reliable work queue on Redis.
//!
//! # Features
//!
//! - **Named Queues**: FIFO lists or weight-ordered sorted sets, registered once and shared by every process
//! - **At-Least-Once Delivery**: shifted messages stay in a pending store until confirmed
//! - **Crash Recovery**: a lock-guarded sweep returns abandoned pending messages to their queues
//! - **Connection Reuse**: health-checked Redis pools per configuration
//! - **Workers**: concurrent consumers with typed async/sync handlers, plus a periodic reclaimer
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use redisque::{ConnectionConfig, ConnectionManager, QueueManager, QueueOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connections = ConnectionManager::new(ConnectionConfig::new("127.0.0.1", 6379));
//!     let manager = QueueManager::connect(&connections, "").await?;
//!
//!     let queue = manager
//!         .new_queue(QueueOptions::new("emails").expire(3600))
//!         .await?;
//!
//!     let msg = json!({"to": "user@example.com"});
//!     queue.push(msg.as_object().cloned().unwrap_or_default(), 0).await?;
//!
//!     if let Some(msg) = queue.shift().await? {
//!         println!("Sending email to: {}", msg["to"]);
//!         queue.confirm(true, &msg).await?;
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod keys;
pub mod lock;
pub mod message;
pub mod queue;
pub mod storage;
pub mod worker;

pub use config::{ConnectionConfig, DEFAULT_TTL_SECS, Priority, QueueOptions};
pub use connection::ConnectionManager;
pub use error::{ErrorKind, QueueError, Result};
pub use keys::{DEFAULT_PREFIX, KeySpace};
pub use lock::{DistributedLock, LockGrant, LockToken, local_machine_id, machine_uid};
pub use message::{Envelope, Payload, TransferRecord};
pub use queue::{
    Backing, ConfirmTarget, Queue, QueueDescriptor, QueueManager, RECLAIM_OPERATION,
    ReclaimOptions, Registry,
};
pub use storage::{MemoryStore, RedisStore, Store, StoreError};
pub use worker::*;
