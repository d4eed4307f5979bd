use crate::{Priority, QueueError, QueueManager, ReclaimOptions, Result};
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ReclaimerOptions {
    pub priorities: Vec<Priority>,
    /// Pause between sweeps
    pub interval: Duration,
    pub machine_id: Option<String>,
    pub window: Option<Duration>,
    pub min_idle: Duration,
}

impl Default for ReclaimerOptions {
    fn default() -> Self {
        Self {
            priorities: Priority::all().to_vec(),
            interval: Duration::from_secs(60),
            machine_id: None,
            window: None,
            min_idle: Duration::from_secs(60),
        }
    }
}

impl ReclaimerOptions {
    fn reclaim_options(&self, priority: Priority) -> ReclaimOptions {
        let mut options = ReclaimOptions::new(priority).with_min_idle(self.min_idle);
        if let Some(machine_id) = &self.machine_id {
            options = options.with_machine_id(machine_id);
        }
        if let Some(window) = self.window {
            options = options.with_window(window);
        }
        options
    }
}

/// Periodically returns abandoned pending messages to their queues.
#[derive(Clone)]
pub struct Reclaimer {
    manager: QueueManager,
    options: ReclaimerOptions,
    running: Arc<RwLock<bool>>,
    shutdown_tx: broadcast::Sender<()>,
    worker_id: String,
}

impl Reclaimer {
    pub fn new(manager: QueueManager, options: ReclaimerOptions) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            manager,
            options,
            running: Arc::new(RwLock::new(false)),
            shutdown_tx,
            worker_id: Uuid::new_v4().to_string(),
        }
    }

    /// One sweep of `priority`. Contention with another sweeper counts as 0.
    pub async fn sweep_once(&self, priority: Priority) -> Result<usize> {
        match self
            .manager
            .reclaim_pending(&self.options.reclaim_options(priority))
            .await
        {
            Err(QueueError::ClientLockFail { holder, .. }) => {
                debug!(
                    "Reclaimer {} skipped {} priority, sweep held by {}",
                    self.worker_id, priority, holder
                );
                Ok(0)
            }
            other => other,
        }
    }

    /// Sweeps every configured priority until [`stop`](Self::stop).
    pub async fn start(&self) {
        info!(
            "Starting reclaimer {} every {:?}",
            self.worker_id, self.options.interval
        );
        *self.running.write().await = true;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        while *self.running.read().await {
            for priority in &self.options.priorities {
                if let Err(e) = self.sweep_once(*priority).await {
                    error!(
                        "Reclaimer {} failed on {} priority: {}",
                        self.worker_id, priority, e
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.options.interval) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("Reclaimer {} stopped", self.worker_id);
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        let _ = self.shutdown_tx.send(());
    }
}
