//! Health-checked reuse of Redis connections.
//!
//! A [`ConnectionManager`] is created once at startup and handed to whatever
//! builds queues. Connections are cached per configuration and trusted
//! without a round-trip for `min(socket timeout, wait timeout)` after their
//! last successful check; past that window they are pinged and rebuilt when
//! the ping fails. The cache map is only locked to read or write an
//! entry, never across a round-trip, so concurrent lookups may both probe
//! or both reconnect; the last one stored wins.

use crate::config::ConnectionConfig;
use crate::storage::{RedisStore, Store};
use crate::{QueueError, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct CachedConnection {
    store: RedisStore,
    last_refresh: Instant,
}

pub struct ConnectionManager {
    default_config: RwLock<ConnectionConfig>,
    named: RwLock<HashMap<String, ConnectionConfig>>,
    socket_timeout: Option<Duration>,
    conns: RwLock<HashMap<String, CachedConnection>>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

impl ConnectionManager {
    pub fn new(default_config: ConnectionConfig) -> Self {
        Self {
            default_config: RwLock::new(default_config),
            named: RwLock::new(HashMap::new()),
            socket_timeout: None,
            conns: RwLock::new(HashMap::new()),
        }
    }

    /// Caps the no-ping reuse window, like a transport-level socket timeout.
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    pub fn set_default_config(&self, config: ConnectionConfig) {
        if let Ok(mut guard) = self.default_config.write() {
            *guard = config;
        }
    }

    pub fn default_config(&self) -> ConnectionConfig {
        self.default_config
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn set_named_config(&self, name: &str, config: ConnectionConfig) {
        if let Ok(mut guard) = self.named.write() {
            guard.insert(name.to_string(), config);
        }
    }

    /// The empty name resolves to the default configuration.
    pub fn named_config(&self, name: &str) -> Result<ConnectionConfig> {
        if name.is_empty() {
            return Ok(self.default_config());
        }

        self.named
            .read()
            .ok()
            .and_then(|guard| guard.get(name).cloned())
            .ok_or_else(|| QueueError::ClientNotExist(name.to_string()))
    }

    pub fn reuse_window(&self, config: &ConnectionConfig) -> Duration {
        match self.socket_timeout {
            Some(socket) => socket.min(config.wait_timeout()),
            None => config.wait_timeout(),
        }
    }

    /// Connection for `config`, or for the default configuration when `None`.
    pub async fn get_connection(&self, config: Option<&ConnectionConfig>) -> Result<RedisStore> {
        let config = match config {
            Some(config) => config.clone(),
            None => self.default_config(),
        };
        let key = config.cache_key();
        let window = self.reuse_window(&config);

        if let Some(cached) = self.cached(&key) {
            if cached.last_refresh.elapsed() < window {
                return Ok(cached.store);
            }

            match cached.store.ping().await {
                Ok(()) => {
                    debug!("Connection {} passed health check", &key[..8]);
                    self.remember(&key, cached.store.clone());
                    return Ok(cached.store);
                }
                Err(e) => {
                    warn!("Connection {} failed health check: {}", &key[..8], e);
                    self.forget(&key);
                }
            }
        }

        let store = RedisStore::open(&config.to_url(), &key)
            .map_err(|e| QueueError::ClientCannotConnect(e.to_string()))?;
        store
            .ping()
            .await
            .map_err(|e| QueueError::ClientCannotConnect(e.to_string()))?;

        info!(
            "Connected to Redis at {}:{} db {}",
            config.host, config.port, config.database
        );

        self.remember(&key, store.clone());
        Ok(store)
    }

    fn cached(&self, key: &str) -> Option<CachedConnection> {
        self.conns
            .read()
            .ok()
            .and_then(|conns| conns.get(key).cloned())
    }

    fn remember(&self, key: &str, store: RedisStore) {
        if let Ok(mut conns) = self.conns.write() {
            conns.insert(
                key.to_string(),
                CachedConnection {
                    store,
                    last_refresh: Instant::now(),
                },
            );
        }
    }

    fn forget(&self, key: &str) {
        if let Ok(mut conns) = self.conns.write() {
            conns.remove(key);
        }
    }

    /// Connection for a configuration registered with [`set_named_config`](Self::set_named_config).
    pub async fn get_named_connection(&self, name: &str) -> Result<RedisStore> {
        let config = self.named_config(name)?;
        self.get_connection(Some(&config)).await
    }

    pub fn cached_count(&self) -> usize {
        self.conns.read().map(|conns| conns.len()).unwrap_or(0)
    }

    /// Drops every cached connection.
    pub fn reset(&self) {
        if let Ok(mut conns) = self.conns.write() {
            conns.clear();
        }
    }
}
