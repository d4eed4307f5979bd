//! Connection and queue configuration

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

/// Fallback lifetime (one day) for negative expiries and unset reclaim windows.
pub const DEFAULT_TTL_SECS: i64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: i64,
    /// Seconds a connection is trusted without a fresh ping
    pub wait_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            database: 0,
            wait_timeout_secs: 120,
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string()).filter(|p| !p.is_empty());
        self
    }

    pub fn with_database(mut self, database: i64) -> Self {
        self.database = database;
        self
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn to_url(&self) -> String {
        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.database
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }

    /// Deterministic cache key: SHA-256 over the field-sorted JSON form.
    pub fn cache_key(&self) -> String {
        let sorted: BTreeMap<&str, serde_json::Value> = BTreeMap::from([
            ("database", self.database.into()),
            ("host", self.host.clone().into()),
            ("password", self.password.clone().into()),
            ("port", self.port.into()),
            ("wait_timeout", self.wait_timeout_secs.into()),
        ]);
        let json = serde_json::to_string(&sorted).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Priority class of a queue. Selects which pending store holds its transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_u8(&self) -> u8 {
        match self {
            Priority::Normal => 0,
            Priority::High => 1,
        }
    }

    /// Suffix of the pending-store keys
    pub fn transfer_suffix(&self) -> &'static str {
        match self {
            Priority::Normal => "common",
            Priority::High => "important",
        }
    }

    /// Default reclaim window: an hour for normal queues, fifteen minutes for high.
    pub fn default_reclaim_window(&self) -> Duration {
        match self {
            Priority::Normal => Duration::from_secs(3600),
            Priority::High => Duration::from_secs(900),
        }
    }

    pub fn all() -> [Priority; 2] {
        [Priority::Normal, Priority::High]
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        if value == 0 {
            Priority::Normal
        } else {
            Priority::High
        }
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.as_u8()
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub queue_name: String,
    /// Label of the connection the caller obtained the store from
    pub conn_name: String,
    pub is_sort: bool,
    pub priority: Priority,
    /// Message lifetime in seconds. 0 = never expires, negative = default.
    pub expire: i64,
    /// Reclaim window in seconds. Non-positive = default.
    pub trans_time: i64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            queue_name: String::new(),
            conn_name: String::new(),
            is_sort: false,
            priority: Priority::Normal,
            expire: 0,
            trans_time: 0,
        }
    }
}

impl QueueOptions {
    pub fn new(queue_name: &str) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            ..Default::default()
        }
    }

    pub fn sorted(mut self, is_sort: bool) -> Self {
        self.is_sort = is_sort;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn expire(mut self, seconds: i64) -> Self {
        self.expire = seconds;
        self
    }

    pub fn trans_time(mut self, seconds: i64) -> Self {
        self.trans_time = seconds;
        self
    }

    pub fn conn_name(mut self, conn_name: &str) -> Self {
        self.conn_name = conn_name.to_string();
        self
    }

    /// Trims the name and resolves defaulted lifetimes.
    pub fn normalized(&self) -> Self {
        Self {
            queue_name: self.queue_name.trim().to_string(),
            conn_name: self.conn_name.trim().to_string(),
            is_sort: self.is_sort,
            priority: self.priority,
            expire: if self.expire < 0 {
                DEFAULT_TTL_SECS
            } else {
                self.expire
            },
            trans_time: if self.trans_time <= 0 {
                DEFAULT_TTL_SECS
            } else {
                self.trans_time
            },
        }
    }
}
