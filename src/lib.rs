//! PostMQ - embeddable MQTT routing and session core
//!
//! The subscription directory, session/queue layer, retained-message store,
//! and post office of an MQTT broker, with pluggable storage backends.
//! Transport, codec, and policy layers live in the embedding application
//! and drive this crate through [`Broker`].

pub mod broker;
pub mod config;
pub mod message;
pub mod session;
pub mod storage;
pub mod topic;

pub use broker::{Broker, BrokerError, ClientHandle, DeliveryStatus, RoutingResults};
pub use config::{Config, StorageBackendKind};
pub use message::{EnqueuedMessage, Publish, QoS, RetainedMessage};
pub use session::{OutboundMessage, SessionRegistry};
pub use storage::{FjallStore, MemoryStore, RedisStore, Storage, StorageError};
pub use topic::{Subscription, SubscriptionDirectory, Topic, TopicError};
