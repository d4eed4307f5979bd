//! Store key layout. Other tooling reads these keys directly, keep them stable.

use crate::config::Priority;

pub const DEFAULT_PREFIX: &str = "Redisque-RedisQueue";

pub const QUEUE_TYPE_SORTED: &str = "issort";
pub const QUEUE_TYPE_LIST: &str = "nosort";

const ALL_QUEUES: &str = "all_queues";
const DELIMITER: char = '|';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl KeySpace {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Hash of queue name -> queue key
    pub fn registry(&self) -> String {
        format!("{}:{}", self.prefix, ALL_QUEUES)
    }

    pub fn queue(&self, queue_name: &str, is_sort: bool, priority: Priority) -> String {
        let sort_type = if is_sort {
            QUEUE_TYPE_SORTED
        } else {
            QUEUE_TYPE_LIST
        };
        format!(
            "{prefix}{d}{queue_name}{d}{sort_type}{d}{priority}",
            prefix = self.prefix,
            d = DELIMITER,
            priority = priority.as_u8(),
        )
    }

    /// Pending hash: fingerprint -> transfer record
    pub fn transfer_table(&self, priority: Priority) -> String {
        format!("{}:transfer_tab_{}", self.prefix, priority.transfer_suffix())
    }

    /// Pending sorted set: fingerprint scored by transfer time
    pub fn transfer_queue(&self, priority: Priority) -> String {
        format!("{}:transfer_que_{}", self.prefix, priority.transfer_suffix())
    }

    pub fn lock(&self, operation: &str, data_id: &str) -> String {
        format!("{}:operate_lock:{}:{}", self.prefix, operation, data_id)
    }

    /// Splits a queue key back into `(name, is_sort, priority)`.
    pub fn parse_queue(&self, queue_key: &str) -> Option<(String, bool, Priority)> {
        let rest = queue_key
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix(DELIMITER)?;

        let mut parts = rest.rsplitn(3, DELIMITER);
        let priority = parts.next()?;
        let sort_type = parts.next()?;
        let name = parts.next()?;

        let is_sort = match sort_type {
            QUEUE_TYPE_SORTED => true,
            QUEUE_TYPE_LIST => false,
            _ => return None,
        };
        let priority = match priority {
            "0" => Priority::Normal,
            "1" => Priority::High,
            _ => return None,
        };

        if name.is_empty() {
            return None;
        }

        Some((name.to_string(), is_sort, priority))
    }
}
