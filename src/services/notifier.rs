//! Post-commit lifecycle notifications.
//!
//! The engine hands committed facts to [`LifecycleNotifier::notify`], which only
//! enqueues. A single worker drains the queue in order and retries each delivery
//! with exponential backoff. A full queue or an exhausted event is logged and
//! dropped; nothing here can affect a committed transaction.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::NotifierConfig;
use crate::models::LifecycleEvent;

const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, event: &LifecycleEvent) -> Result<(), SinkError>;
}

/// Appends each event to a Redis stream named after the topic.
pub struct RedisStreamSink {
    conn: MultiplexedConnection,
    max_len: usize,
}

impl RedisStreamSink {
    pub fn new(conn: MultiplexedConnection, max_len: usize) -> Self {
        Self { conn, max_len }
    }

    /// Opens a multiplexed connection and checks it with PING.
    pub async fn connect(redis_url: &str, max_len: usize) -> Result<Self, SinkError> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self::new(conn, max_len))
    }
}

#[async_trait]
impl NotificationSink for RedisStreamSink {
    async fn publish(&self, topic: &str, key: &str, event: &LifecycleEvent) -> Result<(), SinkError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();

        let _: String = redis::cmd("XADD")
            .arg(topic)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg("key")
            .arg(key)
            .arg("type")
            .arg(event.kind())
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn publish(&self, topic: &str, key: &str, event: &LifecycleEvent) -> Result<(), SinkError> {
        info!(topic, key, event_type = event.kind(), event_id = %event.id, "lifecycle event");
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Delivery {
    topic: String,
    max_attempts: u32,
    retry_backoff: Duration,
}

#[derive(Clone)]
pub struct LifecycleNotifier {
    queue: mpsc::Sender<LifecycleEvent>,
}

impl LifecycleNotifier {
    /// Starts the delivery worker. It stops once every notifier handle is dropped
    /// and the queue has drained.
    pub fn spawn(sink: Arc<dyn NotificationSink>, config: &NotifierConfig) -> (Self, JoinHandle<()>) {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let delivery = Delivery {
            topic: config.topic.clone(),
            max_attempts: config.max_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        };

        let worker = tokio::spawn(run_worker(rx, sink, delivery));
        (Self { queue }, worker)
    }

    /// Enqueues without waiting.
    pub fn notify(&self, events: Vec<LifecycleEvent>) {
        for event in events {
            match self.queue.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    warn!("notification queue full, dropping {} for booking {}", event.kind(), event.aggregate_id);
                }
                Err(mpsc::error::TrySendError::Closed(event)) => {
                    error!("notification worker stopped, dropping {} for booking {}", event.kind(), event.aggregate_id);
                }
            }
        }
    }
}

async fn run_worker(mut rx: mpsc::Receiver<LifecycleEvent>, sink: Arc<dyn NotificationSink>, delivery: Delivery) {
    while let Some(event) = rx.recv().await {
        deliver(sink.as_ref(), &delivery, &event).await;
    }
    debug!("notification worker finished");
}

async fn deliver(sink: &dyn NotificationSink, delivery: &Delivery, event: &LifecycleEvent) {
    let mut backoff = delivery.retry_backoff;

    for attempt in 1..=delivery.max_attempts {
        match sink.publish(&delivery.topic, &event.aggregate_id, event).await {
            Ok(()) => {
                debug!("published {} {} (attempt {})", event.kind(), event.id, attempt);
                return;
            }
            Err(e) if attempt < delivery.max_attempts => {
                warn!("publish of {} {} failed (attempt {}): {}", event.kind(), event.id, attempt, e);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(e) => {
                error!(
                    "giving up on {} {} for booking {} after {} attempts: {}",
                    event.kind(),
                    event.id,
                    event.aggregate_id,
                    attempt,
                    e
                );
            }
        }
    }
}
