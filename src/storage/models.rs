//! Serialized record shapes for persisted state.
//!
//! Records round-trip identically regardless of backend: fjall stores them
//! as bincode, redis as JSON with base64 payloads. Conversions back to
//! runtime types re-validate topics; a record that fails to parse surfaces
//! as a deserialization error and the read is treated as a miss by callers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::{Result, StorageError};
use crate::message::{EnqueuedMessage, QoS, RetainedMessage};
use crate::topic::{Subscription, Topic};

/// Stored subscription
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct StoredSubscription {
    pub client_id: String,
    pub filter: String,
    pub qos: u8,
}

/// Stored retained message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct StoredRetainedMessage {
    pub topic: String,
    pub qos: u8,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// Stored queue entry
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct StoredEnqueuedMessage {
    pub message_id: u64,
    pub topic: String,
    pub qos: u8,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub retain: bool,
    /// Unix timestamp in milliseconds when the message was enqueued
    pub enqueued_at_ms: u64,
}

/// Binary payloads as base64 strings in textual encodings.
mod base64_bytes {
    use base64::prelude::{Engine, BASE64_STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

fn qos_from_u8(v: u8) -> Result<QoS> {
    QoS::from_u8(v).ok_or_else(|| StorageError::Deserialize(format!("invalid qos level {}", v)))
}

fn system_time_to_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl From<&Subscription> for StoredSubscription {
    fn from(sub: &Subscription) -> Self {
        Self {
            client_id: sub.client_id.to_string(),
            filter: sub.filter.as_str().to_string(),
            qos: sub.qos as u8,
        }
    }
}

impl StoredSubscription {
    pub fn into_subscription(self) -> Result<Subscription> {
        let filter = Topic::filter(&self.filter)
            .map_err(|e| StorageError::Deserialize(e.to_string()))?;
        Ok(Subscription::new(
            self.client_id.as_str(),
            filter,
            qos_from_u8(self.qos)?,
        ))
    }
}

impl From<&RetainedMessage> for StoredRetainedMessage {
    fn from(msg: &RetainedMessage) -> Self {
        Self {
            topic: msg.topic.as_str().to_string(),
            qos: msg.qos as u8,
            payload: msg.payload.to_vec(),
        }
    }
}

impl StoredRetainedMessage {
    pub fn into_retained(self) -> Result<RetainedMessage> {
        let topic =
            Topic::name(&self.topic).map_err(|e| StorageError::Deserialize(e.to_string()))?;
        Ok(RetainedMessage {
            topic,
            qos: qos_from_u8(self.qos)?,
            payload: Bytes::from(self.payload),
        })
    }
}

impl From<&EnqueuedMessage> for StoredEnqueuedMessage {
    fn from(msg: &EnqueuedMessage) -> Self {
        Self {
            message_id: msg.message_id,
            topic: msg.topic.as_str().to_string(),
            qos: msg.qos as u8,
            payload: msg.payload.to_vec(),
            retain: msg.retain,
            enqueued_at_ms: system_time_to_ms(msg.enqueued_at),
        }
    }
}

impl StoredEnqueuedMessage {
    pub fn into_enqueued(self) -> Result<EnqueuedMessage> {
        let topic =
            Topic::name(&self.topic).map_err(|e| StorageError::Deserialize(e.to_string()))?;
        Ok(EnqueuedMessage {
            message_id: self.message_id,
            topic,
            qos: qos_from_u8(self.qos)?,
            payload: Bytes::from(self.payload),
            retain: self.retain,
            enqueued_at: UNIX_EPOCH + Duration::from_millis(self.enqueued_at_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_enqueued() -> StoredEnqueuedMessage {
        StoredEnqueuedMessage {
            message_id: 42,
            topic: "sensors/room1/temp".to_string(),
            qos: 1,
            payload: vec![0x00, 0xff, 0x7f, 0x01],
            retain: true,
            enqueued_at_ms: 1_700_000_000_123,
        }
    }

    #[test]
    fn bincode_round_trip() {
        let original = sample_enqueued();
        let bytes = bincode::encode_to_vec(&original, bincode::config::standard()).unwrap();
        let (decoded, _): (StoredEnqueuedMessage, _) =
            bincode::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn json_round_trip_preserves_binary_payload() {
        let original = sample_enqueued();
        let json = serde_json::to_string(&original).unwrap();
        // payload travels as base64, not as a lossy string
        assert!(json.contains("AP9/AQ=="));
        let decoded: StoredEnqueuedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn retained_round_trip() {
        let original = StoredRetainedMessage {
            topic: "state/lamp".to_string(),
            qos: 2,
            payload: b"on".to_vec(),
        };
        let json = serde_json::to_string(&original).unwrap();
        let decoded: StoredRetainedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(original, decoded);

        let runtime = decoded.into_retained().unwrap();
        assert_eq!(runtime.topic.as_str(), "state/lamp");
        assert_eq!(runtime.qos, QoS::ExactlyOnce);
    }

    #[test]
    fn subscription_round_trip() {
        let original = StoredSubscription {
            client_id: "client-a".to_string(),
            filter: "sensors/+/temp".to_string(),
            qos: 1,
        };
        let bytes = bincode::encode_to_vec(&original, bincode::config::standard()).unwrap();
        let (decoded, _): (StoredSubscription, _) =
            bincode::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(original, decoded);

        let runtime = decoded.into_subscription().unwrap();
        assert_eq!(runtime.filter.as_str(), "sensors/+/temp");
    }

    #[test]
    fn corrupt_qos_is_a_deserialize_error() {
        let record = StoredSubscription {
            client_id: "c".to_string(),
            filter: "a/b".to_string(),
            qos: 9,
        };
        assert!(matches!(
            record.into_subscription(),
            Err(StorageError::Deserialize(_))
        ));
    }
}
