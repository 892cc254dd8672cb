//! Pluggable storage for queues, retained messages, and subscriptions.
//!
//! Three backends implement the same repository contracts and are selected
//! once at startup from configuration:
//! - `memory` - volatile, for non-persistent deployments
//! - `fjall`  - embedded LSM-tree log, durable on the local disk
//! - `redis`  - remote key-value store
//!
//! The session registry and post office only ever see the trait objects.

mod error;
mod fjall;
mod memory;
mod models;
mod redis;

pub use error::{Result, StorageError};
pub use fjall::FjallStore;
pub use memory::MemoryStore;
pub use models::{StoredEnqueuedMessage, StoredRetainedMessage, StoredSubscription};
pub use redis::RedisStore;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use crate::config::{StorageBackendKind, StorageConfig};
use crate::message::{EnqueuedMessage, QoS, RetainedMessage};
use crate::topic::{Subscription, Topic};

/// One session's ordered, FIFO message queue.
///
/// Never shared between clients; safe for concurrent enqueue/dequeue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Append at the tail. For durable backends the message survives a
    /// restart once this returns.
    async fn enqueue(&self, message: EnqueuedMessage) -> Result<()>;

    /// Remove and return the head; `None` when the queue has no elements.
    async fn dequeue(&self) -> Result<Option<EnqueuedMessage>>;

    async fn is_empty(&self) -> Result<bool>;

    /// Discard all enqueued messages and release backend resources for this
    /// key. Clean-session teardown.
    async fn close_and_purge(&self) -> Result<()>;
}

/// Maps client ids to their queues.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn list_queue_names(&self) -> Result<Vec<String>>;

    async fn contains_queue(&self, client_id: &str) -> Result<bool>;

    async fn get_or_create_queue(&self, client_id: &str) -> Result<Arc<dyn MessageQueue>>;

    async fn close(&self) -> Result<()>;
}

/// Keyed store of the last retained message per concrete topic.
#[async_trait]
pub trait RetainedRepository: Send + Sync {
    async fn is_empty(&self) -> Result<bool>;

    /// Store the last known good message for `topic`. An empty payload
    /// behaves as `clean_retained`.
    async fn retain(&self, topic: &Topic, qos: QoS, payload: Bytes) -> Result<()>;

    async fn clean_retained(&self, topic: &Topic) -> Result<()>;

    /// All retained messages whose topic matches `filter`, using the same
    /// wildcard semantics as the subscription directory.
    async fn retained_on_topic(&self, filter: &Topic) -> Result<Vec<RetainedMessage>>;
}

/// Durable backing for the in-memory subscription directory; loaded at
/// startup, written through on change.
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn list_all_subscriptions(&self) -> Result<Vec<Subscription>>;

    async fn add_new_subscription(&self, subscription: &Subscription) -> Result<()>;

    async fn remove_subscription(&self, filter: &str, client_id: &str) -> Result<()>;
}

/// The repository set picked at startup.
#[derive(Clone)]
pub struct Storage {
    pub queues: Arc<dyn QueueRepository>,
    pub retained: Arc<dyn RetainedRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
}

impl Storage {
    /// Build the configured backend. Never inspects types at runtime
    /// afterwards; callers hold only the trait objects.
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        match config.backend {
            StorageBackendKind::Memory => {
                info!("storage backend: memory (no durability across restarts)");
                let store = Arc::new(MemoryStore::new());
                Ok(Self {
                    queues: store.clone(),
                    retained: store.clone(),
                    subscriptions: store,
                })
            }
            StorageBackendKind::Fjall => {
                info!(path = %config.fjall.path.display(), "storage backend: fjall");
                let store = Arc::new(FjallStore::open(&config.fjall.path)?);
                Ok(Self {
                    queues: store.clone(),
                    retained: store.clone(),
                    subscriptions: store,
                })
            }
            StorageBackendKind::Redis => {
                info!(url = %config.redis.url, "storage backend: redis");
                let store =
                    Arc::new(RedisStore::connect(&config.redis.url, &config.redis.key_prefix).await?);
                Ok(Self {
                    queues: store.clone(),
                    retained: store.clone(),
                    subscriptions: store,
                })
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.queues.close().await
    }
}
