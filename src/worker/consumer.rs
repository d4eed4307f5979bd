use crate::message::Payload;
use crate::{Queue, QueueError, Result};
use log::{debug, error, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore, broadcast};
use uuid::Uuid;

pub type MessageHandler =
    Box<dyn Fn(Payload) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Messages handled at the same time
    pub concurrency: usize,
    /// Loops shifting from the queue
    pub num_workers: usize,
    /// Pause after finding the queue empty
    pub poll_interval: Duration,
    /// Return failed messages to the queue instead of dropping them
    pub requeue_failed: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            num_workers: 1,
            poll_interval: Duration::from_millis(500),
            requeue_failed: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMetrics {
    pub active_tasks: usize,
    pub available_slots: usize,
    pub max_concurrency: usize,
    pub processed: usize,
    pub failed: usize,
}

/// Shifts messages from one queue and confirms each with its handler's outcome.
///
/// A message is confirmed `ok` when the handler returns `Ok`. Otherwise it is
/// confirmed negatively and goes back to the queue, or is dropped when
/// `requeue_failed` is off. Messages of a crashed consumer stay pending until
/// a reclaim sweep returns them.
pub struct Consumer {
    queue: Queue,
    handler: Arc<RwLock<Option<MessageHandler>>>,
    task_semaphore: Arc<Semaphore>,
    running: Arc<RwLock<bool>>,
    shutdown_tx: broadcast::Sender<()>,
    worker_id: String,
    active_tasks: Arc<AtomicUsize>,
    processed: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    options: ConsumerOptions,
}

impl Clone for Consumer {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            handler: self.handler.clone(),
            task_semaphore: self.task_semaphore.clone(),
            running: self.running.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            worker_id: self.worker_id.clone(),
            active_tasks: self.active_tasks.clone(),
            processed: self.processed.clone(),
            failed: self.failed.clone(),
            options: self.options.clone(),
        }
    }
}

impl Consumer {
    pub fn new(queue: Queue, options: ConsumerOptions) -> Self {
        let options = ConsumerOptions {
            concurrency: options.concurrency.max(1),
            num_workers: options.num_workers.max(1),
            ..options
        };
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            queue,
            handler: Arc::new(RwLock::new(None)),
            task_semaphore: Arc::new(Semaphore::new(options.concurrency)),
            running: Arc::new(RwLock::new(false)),
            shutdown_tx,
            worker_id: Uuid::new_v4().to_string(),
            active_tasks: Arc::new(AtomicUsize::new(0)),
            processed: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
            options,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Handler for I/O-bound work. The payload is deserialized into `T` first.
    pub async fn register_async_handler<F, Fut, T>(&self, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
        T: for<'de> serde::Deserialize<'de> + Send + 'static,
    {
        let boxed_handler: MessageHandler = Box::new(move |msg: Payload| {
            let handler = handler.clone();

            Box::pin(async move {
                let data: T = serde_json::from_value(serde_json::Value::Object(msg))?;
                handler(data).await
            })
        });

        *self.handler.write().await = Some(boxed_handler);
        info!("Registered async handler for queue: {}", self.queue.name());
    }

    // For heavy CPU tasks that block the thread
    pub async fn register_sync_handler<F, T>(&self, handler: F)
    where
        F: Fn(T) -> Result<()> + Send + Sync + Clone + 'static,
        T: for<'de> serde::Deserialize<'de> + Send + 'static,
    {
        let boxed_handler: MessageHandler = Box::new(move |msg: Payload| {
            let handler = handler.clone();
            Box::pin(async move {
                let data: T = serde_json::from_value(serde_json::Value::Object(msg))?;

                tokio::task::spawn_blocking(move || handler(data))
                    .await
                    .map_err(|e| QueueError::QueueOperationFailed(e.to_string()))?
            })
        });

        *self.handler.write().await = Some(boxed_handler);
        info!("Registered sync handler for queue: {}", self.queue.name());
    }

    /// Runs until [`stop`](Self::stop), then waits for in-flight messages.
    pub async fn start(&self) {
        info!(
            "Starting consumer {} on {} with {} workers",
            self.worker_id,
            self.queue.name(),
            self.options.num_workers
        );

        *self.running.write().await = true;

        let mut worker_handles = Vec::new();
        for worker_id in 0..self.options.num_workers {
            let consumer = self.clone();
            worker_handles.push(tokio::spawn(async move {
                consumer.worker_loop(worker_id).await;
            }));
        }

        futures::future::join_all(worker_handles).await;

        // every permit back means nothing is in flight
        match self
            .task_semaphore
            .acquire_many(self.options.concurrency as u32)
            .await
        {
            Ok(permits) => drop(permits),
            Err(e) => warn!("Consumer {} could not drain: {}", self.worker_id, e),
        }

        info!("All workers stopped for consumer {}", self.worker_id);
    }

    async fn worker_loop(&self, worker_id: usize) {
        debug!("Worker {}-{} started", self.worker_id, worker_id);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        while *self.running.read().await {
            let permit = tokio::select! {
                permit = self.task_semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Worker {}-{} semaphore closed", self.worker_id, worker_id);
                        break;
                    }
                },
                _ = shutdown_rx.recv() => break,
            };

            let pause = match self.queue.shift().await {
                Ok(Some(msg)) => {
                    self.active_tasks.fetch_add(1, Ordering::SeqCst);

                    let consumer = self.clone();
                    tokio::spawn(async move {
                        consumer.process_message(msg).await;
                        consumer.active_tasks.fetch_sub(1, Ordering::SeqCst);
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => self.options.poll_interval,
                Err(e) => {
                    error!(
                        "Worker {}-{} failed to shift from {}: {}",
                        self.worker_id,
                        worker_id,
                        self.queue.name(),
                        e
                    );
                    Duration::from_secs(1)
                }
            };
            drop(permit);

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        debug!("Worker {}-{} stopped", self.worker_id, worker_id);
    }

    async fn process_message(&self, msg: Payload) {
        let outcome = {
            let handler = self.handler.read().await;
            match handler.as_ref() {
                Some(handler) => handler(msg.clone()).await,
                None => Err(QueueError::QueueOperationFailed(format!(
                    "no handler registered for queue {}",
                    self.queue.name()
                ))),
            }
        };

        let ok = match outcome {
            Ok(()) => {
                self.processed.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                warn!("Message on {} failed: {}", self.queue.name(), e);
                !self.options.requeue_failed
            }
        };

        if let Err(e) = self.queue.confirm(ok, &msg).await {
            error!("Failed to confirm message on {}: {}", self.queue.name(), e);
        }
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        let _ = self.shutdown_tx.send(());
        info!("Consumer {} stopped", self.worker_id);
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub fn metrics(&self) -> ConsumerMetrics {
        let active = self.active_tasks.load(Ordering::SeqCst);
        ConsumerMetrics {
            active_tasks: active,
            available_slots: self.options.concurrency.saturating_sub(active),
            max_concurrency: self.options.concurrency,
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::{QueueManager, QueueOptions};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Deserialize)]
    struct Email {
        to: String,
    }

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    async fn queue_with(messages: &[serde_json::Value]) -> Queue {
        let manager = QueueManager::new(Arc::new(MemoryStore::new()));
        let queue = manager.new_queue(QueueOptions::new("mail")).await.unwrap();
        for msg in messages {
            queue.push(payload(msg.clone()), 0).await.unwrap();
        }
        queue
    }

    async fn wait_for(consumer: &Consumer, done: impl Fn(&ConsumerMetrics) -> bool) {
        for _ in 0..200 {
            if done(&consumer.metrics()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("consumer did not finish: {:?}", consumer.metrics());
    }

    fn options() -> ConsumerOptions {
        ConsumerOptions {
            concurrency: 2,
            num_workers: 2,
            poll_interval: Duration::from_millis(10),
            requeue_failed: true,
        }
    }

    #[tokio::test]
    async fn processes_and_confirms() {
        let queue = queue_with(&[
            json!({"to": "a@example.com"}),
            json!({"to": "b@example.com"}),
            json!({"to": "c@example.com"}),
        ])
        .await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let consumer = Consumer::new(queue.clone(), options());
        let sink = seen.clone();
        consumer
            .register_async_handler(move |email: Email| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(email.to);
                    Ok(())
                }
            })
            .await;

        let runner = consumer.clone();
        let handle = tokio::spawn(async move { runner.start().await });

        wait_for(&consumer, |m| m.processed == 3).await;
        consumer.stop().await;
        handle.await.unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["a@example.com", "b@example.com", "c@example.com"]);
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(queue.pending_len().await.unwrap(), 0);
        assert!(!consumer.is_running().await);
    }

    #[tokio::test]
    async fn failed_messages_are_dropped_when_asked() {
        let queue = queue_with(&[json!({"to": "x"}), json!({"wrong": "shape"})]).await;

        let consumer = Consumer::new(
            queue.clone(),
            ConsumerOptions {
                requeue_failed: false,
                ..options()
            },
        );
        consumer
            .register_sync_handler(|email: Email| {
                if email.to.is_empty() {
                    return Err(QueueError::QueueMessageEmpty);
                }
                Ok(())
            })
            .await;

        let runner = consumer.clone();
        let handle = tokio::spawn(async move { runner.start().await });

        wait_for(&consumer, |m| m.processed + m.failed == 2).await;
        consumer.stop().await;
        handle.await.unwrap();

        let metrics = consumer.metrics();
        assert_eq!(metrics.processed, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.active_tasks, 0);
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(queue.pending_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_messages_go_back_to_the_queue() {
        let queue = queue_with(&[json!({"to": "retry@example.com"})]).await;

        let consumer = Consumer::new(queue.clone(), options());
        consumer
            .register_async_handler(|_: Email| async {
                Err(QueueError::QueueOperationFailed("smtp down".to_string()))
            })
            .await;

        let runner = consumer.clone();
        let handle = tokio::spawn(async move { runner.start().await });

        wait_for(&consumer, |m| m.failed >= 1).await;
        consumer.stop().await;
        handle.await.unwrap();

        assert_eq!(consumer.metrics().processed, 0);
        assert_eq!(queue.len().await.unwrap(), 1);
        assert_eq!(queue.pending_len().await.unwrap(), 0);
    }
}
