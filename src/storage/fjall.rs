//! Fjall-based storage backend.
//!
//! Uses fjall (an LSM-tree based embedded database) with one partition per
//! concern. Queue entries are keyed `client_id \0 seq` with a big-endian
//! sequence number, so a prefix scan walks one client's queue in FIFO
//! order; the per-queue head/tail indices are rebuilt from the partition at
//! open.

use std::path::Path;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use parking_lot::Mutex;
use tracing::warn;

use super::error::{Result, StorageError};
use super::models::{StoredEnqueuedMessage, StoredRetainedMessage, StoredSubscription};
use super::{MessageQueue, QueueRepository, RetainedRepository, SubscriptionRepository};
use crate::message::{EnqueuedMessage, QoS, RetainedMessage};
use crate::topic::{Subscription, Topic};

const QUEUE_KEY_SEPARATOR: u8 = 0x00;
const SUBSCRIPTION_KEY_SEPARATOR: u8 = 0x1f;

type QueueMap = DashMap<String, Arc<FjallQueue>>;

/// All three repository contracts over a fjall keyspace.
pub struct FjallStore {
    keyspace: Keyspace,
    queues: PartitionHandle,
    retained: PartitionHandle,
    subscriptions: PartitionHandle,
    open_queues: Arc<QueueMap>,
}

impl FjallStore {
    /// Open (or create) a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;

        let queues = keyspace.open_partition("queues", PartitionCreateOptions::default())?;
        let retained = keyspace.open_partition("retained", PartitionCreateOptions::default())?;
        let subscriptions =
            keyspace.open_partition("subscriptions", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            queues,
            retained,
            subscriptions,
            open_queues: Arc::new(DashMap::new()),
        })
    }

    fn serialize<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
        bincode::encode_to_vec(value, bincode::config::standard()).map_err(StorageError::from)
    }

    fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(StorageError::from)
    }
}

fn queue_prefix(client_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(client_id.len() + 1);
    prefix.extend_from_slice(client_id.as_bytes());
    prefix.push(QUEUE_KEY_SEPARATOR);
    prefix
}

fn queue_key(client_id: &str, seq: u64) -> Vec<u8> {
    let mut key = queue_prefix(client_id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn subscription_key(client_id: &str, filter: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(client_id.len() + filter.len() + 1);
    key.extend_from_slice(client_id.as_bytes());
    key.push(SUBSCRIPTION_KEY_SEPARATOR);
    key.extend_from_slice(filter.as_bytes());
    key
}

struct QueueIndex {
    head: u64,
    tail: u64,
}

/// One client's durable queue. An enqueue is synced to disk before it
/// returns, satisfying the persistent-session durability contract.
pub struct FjallQueue {
    client_id: String,
    keyspace: Keyspace,
    partition: PartitionHandle,
    index: Mutex<QueueIndex>,
    open_queues: Weak<QueueMap>,
}

#[async_trait]
impl MessageQueue for FjallQueue {
    async fn enqueue(&self, message: EnqueuedMessage) -> Result<()> {
        let record = StoredEnqueuedMessage::from(&message);
        let bytes = FjallStore::serialize(&record)?;

        let mut index = self.index.lock();
        self.partition
            .insert(queue_key(&self.client_id, index.tail), bytes)?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        index.tail += 1;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<EnqueuedMessage>> {
        let mut index = self.index.lock();
        while index.head < index.tail {
            let key = queue_key(&self.client_id, index.head);
            index.head += 1;
            let Some(bytes) = self.partition.get(&key)? else {
                continue;
            };
            self.partition.remove(&key)?;
            match FjallStore::deserialize::<StoredEnqueuedMessage>(&bytes)
                .and_then(StoredEnqueuedMessage::into_enqueued)
            {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    // Treat an unreadable record as a miss and keep draining
                    warn!(client_id = %self.client_id, error = %e, "skipping corrupt queue entry");
                }
            }
        }
        Ok(None)
    }

    async fn is_empty(&self) -> Result<bool> {
        let index = self.index.lock();
        Ok(index.head >= index.tail)
    }

    async fn close_and_purge(&self) -> Result<()> {
        let mut index = self.index.lock();
        for seq in index.head..index.tail {
            self.partition.remove(queue_key(&self.client_id, seq))?;
        }
        index.head = index.tail;
        drop(index);

        self.keyspace.persist(PersistMode::SyncAll)?;
        if let Some(open_queues) = self.open_queues.upgrade() {
            open_queues.remove(&self.client_id);
        }
        Ok(())
    }
}

#[async_trait]
impl QueueRepository for FjallStore {
    async fn list_queue_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.open_queues.iter().map(|e| e.key().clone()).collect();
        for item in self.queues.iter() {
            let (key, _) = item?;
            if let Some(pos) = key.iter().position(|b| *b == QUEUE_KEY_SEPARATOR) {
                let client_id = String::from_utf8_lossy(&key[..pos]).to_string();
                if !names.contains(&client_id) {
                    names.push(client_id);
                }
            }
        }
        Ok(names)
    }

    async fn contains_queue(&self, client_id: &str) -> Result<bool> {
        if self.open_queues.contains_key(client_id) {
            return Ok(true);
        }
        let mut scan = self.queues.prefix(queue_prefix(client_id));
        Ok(scan.next().transpose()?.is_some())
    }

    async fn get_or_create_queue(&self, client_id: &str) -> Result<Arc<dyn MessageQueue>> {
        if let Some(queue) = self.open_queues.get(client_id) {
            return Ok(queue.clone());
        }

        // Rebuild head/tail from the surviving rows
        let mut head = u64::MAX;
        let mut tail = 0u64;
        let prefix = queue_prefix(client_id);
        for item in self.queues.prefix(prefix.clone()) {
            let (key, _) = item?;
            let seq_bytes: [u8; 8] = key[prefix.len()..]
                .try_into()
                .map_err(|_| StorageError::Deserialize("malformed queue key".to_string()))?;
            let seq = u64::from_be_bytes(seq_bytes);
            head = head.min(seq);
            tail = tail.max(seq + 1);
        }
        if head == u64::MAX {
            head = 0;
            tail = 0;
        }

        let queue = self
            .open_queues
            .entry(client_id.to_string())
            .or_insert_with(|| {
                Arc::new(FjallQueue {
                    client_id: client_id.to_string(),
                    keyspace: self.keyspace.clone(),
                    partition: self.queues.clone(),
                    index: Mutex::new(QueueIndex { head, tail }),
                    open_queues: Arc::downgrade(&self.open_queues),
                })
            })
            .clone();
        Ok(queue)
    }

    async fn close(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

#[async_trait]
impl RetainedRepository for FjallStore {
    async fn is_empty(&self) -> Result<bool> {
        let mut scan = self.retained.iter();
        Ok(scan.next().transpose()?.is_none())
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
        self.retained
            .insert(topic.as_str(), FjallStore::serialize(&record)?)?;
        Ok(())
    }

    async fn clean_retained(&self, topic: &Topic) -> Result<()> {
        self.retained.remove(topic.as_str())?;
        Ok(())
    }

    async fn retained_on_topic(&self, filter: &Topic) -> Result<Vec<RetainedMessage>> {
        let mut result = Vec::new();
        for item in self.retained.iter() {
            let (key, value) = item?;
            let message = match FjallStore::deserialize::<StoredRetainedMessage>(&value)
                .and_then(StoredRetainedMessage::into_retained)
            {
                Ok(message) => message,
                Err(e) => {
                    warn!(
                        topic = %String::from_utf8_lossy(&key),
                        error = %e,
                        "skipping corrupt retained entry"
                    );
                    continue;
                }
            };
            if filter.matches(&message.topic) {
                result.push(message);
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl SubscriptionRepository for FjallStore {
    async fn list_all_subscriptions(&self) -> Result<Vec<Subscription>> {
        let mut result = Vec::new();
        for item in self.subscriptions.iter() {
            let (key, value) = item?;
            match FjallStore::deserialize::<StoredSubscription>(&value)
                .and_then(StoredSubscription::into_subscription)
            {
                Ok(subscription) => result.push(subscription),
                Err(e) => {
                    warn!(
                        key = %String::from_utf8_lossy(&key),
                        error = %e,
                        "skipping corrupt subscription entry"
                    );
                }
            }
        }
        Ok(result)
    }

    async fn add_new_subscription(&self, subscription: &Subscription) -> Result<()> {
        let record = StoredSubscription::from(subscription);
        self.subscriptions.insert(
            subscription_key(&record.client_id, &record.filter),
            FjallStore::serialize(&record)?,
        )?;
        Ok(())
    }

    async fn remove_subscription(&self, filter: &str, client_id: &str) -> Result<()> {
        self.subscriptions
            .remove(subscription_key(client_id, filter))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn message(id: u64) -> EnqueuedMessage {
        EnqueuedMessage {
            message_id: id,
            topic: Topic::name("t/a").unwrap(),
            qos: QoS::AtLeastOnce,
            payload: Bytes::from_static(b"x"),
            retain: false,
            enqueued_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn queue_survives_reopen_in_order() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = FjallStore::open(dir.path()).unwrap();
            let queue = store.get_or_create_queue("c1").await.unwrap();
            for id in 1..=3 {
                queue.enqueue(message(id)).await.unwrap();
            }
        }

        let store = FjallStore::open(dir.path()).unwrap();
        assert!(store.contains_queue("c1").await.unwrap());
        let queue = store.get_or_create_queue("c1").await.unwrap();
        for id in 1..=3 {
            assert_eq!(queue.dequeue().await.unwrap().unwrap().message_id, id);
        }
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_deletes_rows_and_registration() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(dir.path()).unwrap();

        let queue = store.get_or_create_queue("c1").await.unwrap();
        queue.enqueue(message(1)).await.unwrap();
        queue.close_and_purge().await.unwrap();

        assert!(!store.contains_queue("c1").await.unwrap());
        assert!(store.list_queue_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retained_and_subscriptions_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(dir.path()).unwrap();

        let topic = Topic::name("state/lamp").unwrap();
        store
            .retain(&topic, QoS::AtLeastOnce, Bytes::from_static(b"on"))
            .await
            .unwrap();
        let matches = store
            .retained_on_topic(&Topic::filter("state/+").unwrap())
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].payload.as_ref(), b"on");

        let sub = Subscription::new("c1", Topic::filter("a/#").unwrap(), QoS::AtLeastOnce);
        store.add_new_subscription(&sub).await.unwrap();
        assert_eq!(store.list_all_subscriptions().await.unwrap(), vec![sub]);
        store.remove_subscription("a/#", "c1").await.unwrap();
        assert!(store.list_all_subscriptions().await.unwrap().is_empty());

        // empty payload acts as clean
        store.retain(&topic, QoS::AtLeastOnce, Bytes::new()).await.unwrap();
        assert!(RetainedRepository::is_empty(&store).await.unwrap());
    }
}
