//! Named queues, their registry and the transfer/confirm protocol

pub mod engine;
pub mod manager;
pub mod reclaim;
pub mod registry;
pub mod transfer;

pub use engine::{Backing, Queue};
pub use manager::QueueManager;
pub use reclaim::{RECLAIM_OPERATION, ReclaimOptions};
pub use registry::{QueueDescriptor, Registry};
pub use transfer::ConfirmTarget;

use crate::keys::KeySpace;
use crate::lock::DistributedLock;
use crate::storage::Store;
use std::sync::Arc;

/// State shared by a manager and every queue it hands out.
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) keys: KeySpace,
    pub(crate) registry: Registry,
    pub(crate) lock: DistributedLock,
}

impl Shared {
    pub(crate) fn new(store: Arc<dyn Store>, keys: KeySpace) -> Self {
        Self {
            registry: Registry::new(store.clone(), keys.clone()),
            lock: DistributedLock::new(store.clone(), keys.clone()),
            store,
            keys,
        }
    }
}
