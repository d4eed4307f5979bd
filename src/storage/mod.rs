//! Backing-store primitives the queue engine is built on

pub mod batch;
pub mod memory;
pub mod redis;
pub mod traits;

pub use batch::{Batch, Command};
pub use memory::MemoryStore;
pub use self::redis::RedisStore;
pub use traits::{Store, StoreError, StoreResult};
