//! In-memory storage backend.
//!
//! Provides no durability across restarts; configuration selects it only
//! for non-persistent deployments. Semantics otherwise mirror the durable
//! backends, including queue removal on `close_and_purge`.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::error::Result;
use super::{MessageQueue, QueueRepository, RetainedRepository, SubscriptionRepository};
use crate::message::{EnqueuedMessage, QoS, RetainedMessage};
use crate::topic::{Subscription, Topic};

type QueueMap = DashMap<String, Arc<MemoryQueue>>;

/// All three repository contracts over process memory.
pub struct MemoryStore {
    queues: Arc<QueueMap>,
    retained: DashMap<String, RetainedMessage>,
    /// client_id -> filter -> subscription
    subscriptions: DashMap<String, AHashMap<String, Subscription>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
            retained: DashMap::new(),
            subscriptions: DashMap::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// FIFO queue over a locked deque.
pub struct MemoryQueue {
    client_id: String,
    messages: Mutex<VecDeque<EnqueuedMessage>>,
    /// Back-reference for self-removal on purge; Weak so the map can drop
    queues: Weak<QueueMap>,
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn enqueue(&self, message: EnqueuedMessage) -> Result<()> {
        self.messages.lock().push_back(message);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<EnqueuedMessage>> {
        Ok(self.messages.lock().pop_front())
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.messages.lock().is_empty())
    }

    async fn close_and_purge(&self) -> Result<()> {
        self.messages.lock().clear();
        if let Some(queues) = self.queues.upgrade() {
            queues.remove(&self.client_id);
        }
        Ok(())
    }
}

#[async_trait]
impl QueueRepository for MemoryStore {
    async fn list_queue_names(&self) -> Result<Vec<String>> {
        Ok(self.queues.iter().map(|e| e.key().clone()).collect())
    }

    async fn contains_queue(&self, client_id: &str) -> Result<bool> {
        Ok(self.queues.contains_key(client_id))
    }

    async fn get_or_create_queue(&self, client_id: &str) -> Result<Arc<dyn MessageQueue>> {
        let queue = self
            .queues
            .entry(client_id.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryQueue {
                    client_id: client_id.to_string(),
                    messages: Mutex::new(VecDeque::new()),
                    queues: Arc::downgrade(&self.queues),
                })
            })
            .clone();
        Ok(queue)
    }

    async fn close(&self) -> Result<()> {
        self.queues.clear();
        Ok(())
    }
}

#[async_trait]
impl RetainedRepository for MemoryStore {
    async fn is_empty(&self) -> Result<bool> {
        Ok(self.retained.is_empty())
    }

    async fn retain(&self, topic: &Topic, qos: QoS, payload: Bytes) -> Result<()> {
        if payload.is_empty() {
            self.retained.remove(topic.as_str());
        } else {
            self.retained.insert(
                topic.as_str().to_string(),
                RetainedMessage {
                    topic: topic.clone(),
                    qos,
                    payload,
                },
            );
        }
        Ok(())
    }

    async fn clean_retained(&self, topic: &Topic) -> Result<()> {
        self.retained.remove(topic.as_str());
        Ok(())
    }

    async fn retained_on_topic(&self, filter: &Topic) -> Result<Vec<RetainedMessage>> {
        Ok(self
            .retained
            .iter()
            .filter(|entry| filter.matches(&entry.value().topic))
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[async_trait]
impl SubscriptionRepository for MemoryStore {
    async fn list_all_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect())
    }

    async fn add_new_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.subscriptions
            .entry(subscription.client_id.to_string())
            .or_default()
            .insert(subscription.filter.as_str().to_string(), subscription.clone());
        Ok(())
    }

    async fn remove_subscription(&self, filter: &str, client_id: &str) -> Result<()> {
        if let Some(mut entry) = self.subscriptions.get_mut(client_id) {
            entry.remove(filter);
        }
        Ok(())
    }
}
