//! The post office: routes publish and subscribe events.
//!
//! For each publish it updates the retained store when asked, resolves
//! matching subscriptions, negotiates the effective QoS per subscriber, and
//! delivers - directly for connected clients, through the durable queue for
//! offline persistent ones. Per-subscriber failures are isolated in the
//! routing result; one unreachable backend never aborts the fan-out.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::message::{EnqueuedMessage, MessageIdGenerator, Publish, QoS, RetainedMessage};
use crate::session::{OutboundMessage, SessionRegistry};
use crate::storage::{MessageQueue, RetainedRepository, StorageError, SubscriptionRepository};
use crate::topic::{Subscription, SubscriptionDirectory, Topic, TopicError};

/// Why a subscriber did not get a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// No session exists for the subscriber
    NoSession,
    /// Offline with a clean session; nothing to queue onto
    NotPersistent,
    /// Transport channel gone or saturated (QoS 0 direct path)
    TransportUnavailable,
    /// The subscriber's storage backend failed this operation
    Storage(String),
}

/// Per-subscriber outcome of one routed publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Written to the live transport
    Delivered,
    /// Parked on the durable queue for later delivery
    Queued,
    /// Not delivered; the reason says whether that is normal or a failure
    Dropped(DropReason),
}

/// One subscriber's slice of a routing result.
#[derive(Debug, Clone)]
pub struct RoutingOutcome {
    pub client_id: Arc<str>,
    /// Effective QoS, `min(publish, subscription)`
    pub qos: QoS,
    pub status: DeliveryStatus,
}

/// Summary of one publish fan-out, returned by `internal_publish` for
/// embedding callers. Ordinary delivery failures live here, never in an
/// error path.
#[derive(Debug, Default)]
pub struct RoutingResults {
    pub outcomes: Vec<RoutingOutcome>,
    /// Set when a retain-flagged publish failed to update the retained
    /// store; fan-out still ran
    pub retain_error: Option<String>,
}

impl RoutingResults {
    pub fn delivered(&self) -> usize {
        self.count(|s| matches!(s, DeliveryStatus::Delivered))
    }

    pub fn queued(&self) -> usize {
        self.count(|s| matches!(s, DeliveryStatus::Queued))
    }

    pub fn dropped(&self) -> usize {
        self.count(|s| matches!(s, DeliveryStatus::Dropped(_)))
    }

    fn count(&self, pred: impl Fn(&DeliveryStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }
}

/// Errors from the subscribe/unsubscribe path.
#[derive(Debug)]
pub enum SubscribeError {
    /// Malformed filter; rejected before it reaches the directory
    InvalidFilter(TopicError),
    /// The durable write-through failed; in-memory state was not touched
    Storage(StorageError),
}

impl fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFilter(e) => write!(f, "{}", e),
            Self::Storage(e) => write!(f, "subscription storage failed: {}", e),
        }
    }
}

impl std::error::Error for SubscribeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidFilter(e) => Some(e),
            Self::Storage(e) => Some(e),
        }
    }
}

impl From<TopicError> for SubscribeError {
    fn from(err: TopicError) -> Self {
        Self::InvalidFilter(err)
    }
}

impl From<StorageError> for SubscribeError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

pub struct PostOffice {
    directory: Arc<SubscriptionDirectory>,
    registry: Arc<SessionRegistry>,
    retained: Arc<dyn RetainedRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    message_ids: MessageIdGenerator,
}

impl PostOffice {
    pub fn new(
        directory: Arc<SubscriptionDirectory>,
        registry: Arc<SessionRegistry>,
        retained: Arc<dyn RetainedRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
    ) -> Self {
        Self {
            directory,
            registry,
            retained,
            subscriptions,
            message_ids: MessageIdGenerator::new(),
        }
    }

    /// Route one publish to every matching subscriber.
    pub async fn internal_publish(&self, publish: Publish) -> RoutingResults {
        let mut results = RoutingResults::default();

        // Retain update happens before fan-out so it cannot be lost to a
        // partial delivery failure
        if publish.retain {
            let update = self
                .retained
                .retain(&publish.topic, publish.qos, publish.payload.clone())
                .await;
            if let Err(e) = update {
                warn!(topic = %publish.topic, error = %e, "retained store update failed");
                results.retain_error = Some(e.to_string());
            }
        }

        // Collapse multiple matching filters per client to the highest
        // subscription QoS
        let mut per_client: HashMap<Arc<str>, QoS> = HashMap::new();
        for subscription in self.directory.matching(&publish.topic) {
            let entry = per_client
                .entry(subscription.client_id.clone())
                .or_insert(QoS::AtMostOnce);
            if subscription.qos > *entry {
                *entry = subscription.qos;
            }
        }

        for (client_id, subscription_qos) in per_client {
            let qos = publish.qos.min(subscription_qos);
            let status = self
                .deliver_to(&client_id, qos, &publish.topic, &publish.payload, false)
                .await;
            results.outcomes.push(RoutingOutcome {
                client_id,
                qos,
                status,
            });
        }

        debug!(
            topic = %publish.topic,
            delivered = results.delivered(),
            queued = results.queued(),
            dropped = results.dropped(),
            "publish routed"
        );
        results
    }

    /// Deliver one message to one subscriber. Never propagates an error;
    /// failures become this subscriber's outcome.
    async fn deliver_to(
        &self,
        client_id: &str,
        qos: QoS,
        topic: &Topic,
        payload: &bytes::Bytes,
        retain: bool,
    ) -> DeliveryStatus {
        let Some(session) = self.registry.session(client_id) else {
            return DeliveryStatus::Dropped(DropReason::NoSession);
        };
        let (connected, clean_session) = {
            let s = session.read();
            (s.is_connected(), s.clean_session)
        };

        let message = EnqueuedMessage {
            message_id: self.message_ids.next_id(),
            topic: topic.clone(),
            qos,
            payload: payload.clone(),
            retain,
            enqueued_at: SystemTime::now(),
        };

        if connected && qos == QoS::AtMostOnce {
            // QoS 0 bypasses the durable queue
            let outbound = OutboundMessage {
                message_id: message.message_id,
                topic: message.topic,
                qos,
                payload: message.payload,
                retain,
                dup: false,
            };
            return if self.registry.send_direct(client_id, outbound) {
                DeliveryStatus::Delivered
            } else {
                DeliveryStatus::Dropped(DropReason::TransportUnavailable)
            };
        }

        if !connected && clean_session {
            return DeliveryStatus::Dropped(DropReason::NotPersistent);
        }

        // Durable enqueue; for a connected client the registry immediately
        // drains into the inflight window
        match self.registry.enqueue(client_id, message).await {
            Ok(_) if connected => {
                // Delivered once the queue fully drained to the transport;
                // a backlog or full window leaves it queued
                let queue = session.read().queue();
                match queue.is_empty().await {
                    Ok(true) => DeliveryStatus::Delivered,
                    _ => DeliveryStatus::Queued,
                }
            }
            Ok(_) => DeliveryStatus::Queued,
            Err(e) => {
                warn!(client_id, error = %e, "enqueue failed for subscriber");
                DeliveryStatus::Dropped(DropReason::Storage(e.to_string()))
            }
        }
    }

    /// Add a subscription and replay matching retained state through the
    /// regular delivery path. Returns the granted QoS.
    pub async fn subscribe(
        &self,
        client_id: &str,
        filter: &str,
        qos: QoS,
    ) -> Result<QoS, SubscribeError> {
        let filter = Topic::filter(filter)?;
        let subscription = Subscription::new(client_id, filter.clone(), qos);

        // Durable write first; the directory only reflects acknowledged state
        self.subscriptions.add_new_subscription(&subscription).await?;
        self.directory.add(subscription);

        match self.retained.retained_on_topic(&filter).await {
            Ok(retained) => {
                for message in retained {
                    self.replay_retained(client_id, qos, message).await;
                }
            }
            Err(e) => {
                // Replay is best-effort; the subscription itself stands
                warn!(client_id, filter = %filter, error = %e, "retained replay failed");
            }
        }

        Ok(qos)
    }

    async fn replay_retained(&self, client_id: &str, subscription_qos: QoS, message: RetainedMessage) {
        let qos = message.qos.min(subscription_qos);
        let status = self
            .deliver_to(client_id, qos, &message.topic, &message.payload, true)
            .await;
        if let DeliveryStatus::Dropped(reason) = status {
            debug!(client_id, topic = %message.topic, ?reason, "retained replay dropped");
        }
    }

    /// Remove one subscription; no-op if absent.
    pub async fn unsubscribe(&self, client_id: &str, filter: &str) -> Result<(), SubscribeError> {
        let filter = Topic::filter(filter)?;
        self.subscriptions
            .remove_subscription(filter.as_str(), client_id)
            .await?;
        self.directory.remove(&filter, client_id);
        Ok(())
    }

    /// Drop every subscription a client holds, durably and in memory.
    /// Clean-session eviction path.
    pub async fn remove_all_subscriptions(&self, client_id: &str) -> Result<(), SubscribeError> {
        for subscription in self.directory.subscriptions_of(client_id) {
            self.subscriptions
                .remove_subscription(subscription.filter.as_str(), client_id)
                .await?;
        }
        self.directory.remove_all_for(client_id);
        Ok(())
    }

    /// Complete a QoS 1/2 delivery for one subscriber.
    pub async fn acknowledge(&self, client_id: &str, message_id: u64) -> Result<bool, StorageError> {
        self.registry.acknowledge(client_id, message_id).await
    }
}
