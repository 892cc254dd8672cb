//! Redis-based remote storage backend.
//!
//! Key layout, under one configurable prefix:
//! - `{prefix}queue:{client_id}` - list, RPUSH at the tail / LPOP at the head
//! - `{prefix}retained:{topic}`  - single JSON value per concrete topic
//! - `{prefix}sub:{client_id}`   - hash keyed by filter
//!
//! Records are JSON with base64 payloads. Queue and retained state lives
//! entirely in the backend; handles here are stateless, so concurrent
//! producers are serialized by redis itself.

use std::sync::Arc;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client};
use tracing::warn;

use super::error::Result;
use super::models::{StoredEnqueuedMessage, StoredRetainedMessage, StoredSubscription};
use super::{MessageQueue, QueueRepository, RetainedRepository, SubscriptionRepository};
use crate::message::{EnqueuedMessage, QoS, RetainedMessage};
use crate::topic::{Subscription, Topic};

/// All three repository contracts over a redis connection.
pub struct RedisStore {
    manager: ConnectionManager,
    queue_prefix: String,
    retained_prefix: String,
    subscription_prefix: String,
}

impl RedisStore {
    /// Connect and verify the server is reachable. Bounded timeouts keep an
    /// unreachable backend from stalling a publish fan-out indefinitely.
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self> {
        let client = Client::open(url).map_err(super::StorageError::from)?;
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_secs(5))
            .set_response_timeout(Duration::from_secs(5));
        let manager = ConnectionManager::new_with_config(client, config).await?;
        Ok(Self {
            manager,
            queue_prefix: format!("{}queue:", key_prefix),
            retained_prefix: format!("{}retained:", key_prefix),
            subscription_prefix: format!("{}sub:", key_prefix),
        })
    }

    fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection();
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}

/// One client's queue as a redis list.
pub struct RedisQueue {
    manager: ConnectionManager,
    key: String,
    client_id: String,
}

#[async_trait]
impl MessageQueue for RedisQueue {
    async fn enqueue(&self, message: EnqueuedMessage) -> Result<()> {
        let json = serde_json::to_string(&StoredEnqueuedMessage::from(&message))?;
        let mut conn = self.manager.clone();
        let _: () = conn.rpush(&self.key, json).await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<EnqueuedMessage>> {
        let mut conn = self.manager.clone();
        loop {
            let json: Option<String> = conn.lpop(&self.key, None).await?;
            let Some(json) = json else {
                return Ok(None);
            };
            match serde_json::from_str::<StoredEnqueuedMessage>(&json)
                .map_err(super::StorageError::from)
                .and_then(StoredEnqueuedMessage::into_enqueued)
            {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    // Treat an unreadable record as a miss and keep draining
                    warn!(client_id = %self.client_id, error = %e, "skipping corrupt queue entry");
                }
            }
        }
    }

    async fn is_empty(&self) -> Result<bool> {
        let mut conn = self.manager.clone();
        let len: u64 = conn.llen(&self.key).await?;
        Ok(len == 0)
    }

    async fn close_and_purge(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(&self.key).await?;
        Ok(())
    }
}

#[async_trait]
impl QueueRepository for RedisStore {
    async fn list_queue_names(&self) -> Result<Vec<String>> {
        let keys = self.scan_keys(&format!("{}*", self.queue_prefix)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(&self.queue_prefix)
                    .map(|name| name.to_string())
            })
            .collect())
    }

    async fn contains_queue(&self, client_id: &str) -> Result<bool> {
        let mut conn = self.connection();
        let exists: bool = conn
            .exists(format!("{}{}", self.queue_prefix, client_id))
            .await?;
        Ok(exists)
    }

    async fn get_or_create_queue(&self, client_id: &str) -> Result<Arc<dyn MessageQueue>> {
        Ok(Arc::new(RedisQueue {
            manager: self.connection(),
            key: format!("{}{}", self.queue_prefix, client_id),
            client_id: client_id.to_string(),
        }))
    }

    async fn close(&self) -> Result<()> {
        // ConnectionManager closes on drop
        Ok(())
    }
}

#[async_trait]
impl RetainedRepository for RedisStore {
    async fn is_empty(&self) -> Result<bool> {
        let mut conn = self.connection();
        let pattern = format!("{}*", self.retained_prefix);
        let mut iter = conn.scan_match::<_, String>(&pattern).await?;
        Ok(iter.next_item().await.is_none())
    }

    async fn retain(&self, topic: &Topic, qos: QoS, payload: Bytes) -> Result<()> {
        if payload.is_empty() {
            return self.clean_retained(topic).await;
        }
        let record = StoredRetainedMessage {
            topic: topic.as_str().to_string(),
            qos: qos as u8,
            payload: payload.to_vec(),
        };
        let json = serde_json::to_string(&record)?;
        let mut conn = self.connection();
        let _: () = conn
            .set(format!("{}{}", self.retained_prefix, topic.as_str()), json)
            .await?;
        Ok(())
    }

    async fn clean_retained(&self, topic: &Topic) -> Result<()> {
        let mut conn = self.connection();
        let _: () = conn
            .del(format!("{}{}", self.retained_prefix, topic.as_str()))
            .await?;
        Ok(())
    }

    async fn retained_on_topic(&self, filter: &Topic) -> Result<Vec<RetainedMessage>> {
        let keys = self.scan_keys(&format!("{}*", self.retained_prefix)).await?;
        let mut conn = self.connection();
        let mut result = Vec::new();

        for key in keys {
            let Some(topic_str) = key.strip_prefix(&self.retained_prefix) else {
                continue;
            };
            let Ok(topic) = Topic::name(topic_str) else {
                warn!(key = %key, "skipping retained entry with unparsable topic");
                continue;
            };
            if !filter.matches(&topic) {
                continue;
            }
            // Value may have been cleaned between scan and read
            let json: Option<String> = conn.get(&key).await?;
            let Some(json) = json else { continue };
            match serde_json::from_str::<StoredRetainedMessage>(&json)
                .map_err(super::StorageError::from)
                .and_then(StoredRetainedMessage::into_retained)
            {
                Ok(message) => result.push(message),
                Err(e) => warn!(key = %key, error = %e, "skipping corrupt retained entry"),
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl SubscriptionRepository for RedisStore {
    async fn list_all_subscriptions(&self) -> Result<Vec<Subscription>> {
        let keys = self
            .scan_keys(&format!("{}*", self.subscription_prefix))
            .await?;
        let mut conn = self.connection();
        let mut result = Vec::new();

        for key in keys {
            let values: Vec<String> = conn.hvals(&key).await?;
            for json in values {
                match serde_json::from_str::<StoredSubscription>(&json)
                    .map_err(super::StorageError::from)
                    .and_then(StoredSubscription::into_subscription)
                {
                    Ok(subscription) => result.push(subscription),
                    Err(e) => warn!(key = %key, error = %e, "skipping corrupt subscription entry"),
                }
            }
        }
        Ok(result)
    }

    async fn add_new_subscription(&self, subscription: &Subscription) -> Result<()> {
        let record = StoredSubscription::from(subscription);
        let json = serde_json::to_string(&record)?;
        let mut conn = self.connection();
        let _: () = conn
            .hset(
                format!("{}{}", self.subscription_prefix, record.client_id),
                &record.filter,
                json,
            )
            .await?;
        Ok(())
    }

    async fn remove_subscription(&self, filter: &str, client_id: &str) -> Result<()> {
        let mut conn = self.connection();
        let _: () = conn
            .hdel(format!("{}{}", self.subscription_prefix, client_id), filter)
            .await?;
        Ok(())
    }
}
