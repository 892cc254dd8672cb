//! Core message types shared by the routing and storage layers.
//!
//! The wire codec lives outside this crate; these are the logical shapes a
//! transport hands to the post office and the queues hold on to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;

use crate::topic::Topic;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Returns the minimum of two QoS levels (effective delivery QoS)
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

/// An inbound publish event, already decoded and validated by the transport.
#[derive(Debug, Clone)]
pub struct Publish {
    /// Concrete topic name (no wildcards)
    pub topic: Topic,
    /// QoS the publisher sent at
    pub qos: QoS,
    /// Message payload
    pub payload: Bytes,
    /// Retain flag
    pub retain: bool,
    /// Publishing client, if the publish came in over a client connection
    pub source: Option<String>,
}

impl Publish {
    pub fn new(topic: Topic, qos: QoS, payload: Bytes, retain: bool) -> Self {
        Self {
            topic,
            qos,
            payload,
            retain,
            source: None,
        }
    }

    pub fn from_client(mut self, client_id: impl Into<String>) -> Self {
        self.source = Some(client_id.into());
        self
    }
}

/// A message owned by one session's queue until delivered and acknowledged.
///
/// Every matched subscriber gets its own copy with a fresh message id; queues
/// never share messages across sessions.
#[derive(Debug, Clone)]
pub struct EnqueuedMessage {
    /// Broker-assigned id, unique per broker instance
    pub message_id: u64,
    /// Concrete topic the message was published to
    pub topic: Topic,
    /// Effective QoS for this subscriber
    pub qos: QoS,
    /// Message payload
    pub payload: Bytes,
    /// Retain flag as delivered (set on retained-message replay)
    pub retain: bool,
    /// When the message entered the queue
    pub enqueued_at: SystemTime,
}

/// The last known good message on a concrete topic.
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Topic,
    pub qos: QoS,
    pub payload: Bytes,
}

/// Monotonic message id source. One per broker; ids are never reused within
/// a process lifetime.
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    next: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_min_picks_lower_level() {
        assert_eq!(QoS::AtLeastOnce.min(QoS::ExactlyOnce), QoS::AtLeastOnce);
        assert_eq!(QoS::ExactlyOnce.min(QoS::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(QoS::AtLeastOnce.min(QoS::AtLeastOnce), QoS::AtLeastOnce);
    }

    #[test]
    fn qos_from_u8_rejects_out_of_range() {
        assert_eq!(QoS::from_u8(2), Some(QoS::ExactlyOnce));
        assert_eq!(QoS::from_u8(3), None);
    }

    #[test]
    fn message_ids_are_unique() {
        let gen = MessageIdGenerator::new();
        let a = gen.next_id();
        let b = gen.next_id();
        assert_ne!(a, b);
    }
}
