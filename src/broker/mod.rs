//! Broker core assembly.
//!
//! Owns the subscription directory, session registry, and storage, and
//! exposes the embedding API the transport layer drives: connect, publish,
//! subscribe, acknowledge, disconnect. All shared state is constructed here
//! and handed out by reference; there are no process-wide singletons.

mod postoffice;

pub use postoffice::{
    DeliveryStatus, DropReason, PostOffice, RoutingOutcome, RoutingResults, SubscribeError,
};

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::message::{Publish, QoS};
use crate::session::{OpenOutcome, OutboundMessage, SessionRegistry};
use crate::storage::{Storage, StorageError};
use crate::topic::SubscriptionDirectory;

/// Errors surfaced by broker lifecycle operations.
#[derive(Debug)]
pub enum BrokerError {
    /// Storage backend failure
    Storage(StorageError),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
        }
    }
}

impl From<StorageError> for BrokerError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

/// What the transport layer gets back from `connect`: the outbound message
/// stream to pump to the socket.
pub struct ClientHandle {
    pub client_id: Arc<str>,
    /// True when a persistent session was resumed or taken over
    pub session_present: bool,
    pub outbound: mpsc::Receiver<OutboundMessage>,
}

/// The routing and state core of the broker.
pub struct Broker {
    config: Config,
    storage: Storage,
    directory: Arc<SubscriptionDirectory>,
    registry: Arc<SessionRegistry>,
    post_office: PostOffice,
}

impl Broker {
    /// Build the configured storage backend and reload durable state:
    /// the subscription directory and any offline persistent sessions with
    /// pending queues.
    pub async fn open(config: Config) -> Result<Self, BrokerError> {
        let storage = Storage::open(&config.storage).await?;

        let directory = Arc::new(SubscriptionDirectory::new());
        match storage.subscriptions.list_all_subscriptions().await {
            Ok(subscriptions) => {
                let count = subscriptions.len();
                directory.load(subscriptions);
                info!(count, "reloaded subscriptions from storage");
            }
            Err(e) => {
                warn!(error = %e, "could not reload subscriptions; starting with an empty directory");
            }
        }

        let registry = Arc::new(SessionRegistry::new(
            storage.queues.clone(),
            config.session.inflight_window,
            config.session.retry_interval,
        ));
        match storage.queues.list_queue_names().await {
            Ok(names) => {
                for name in &names {
                    registry.restore_offline(name).await?;
                }
                if !names.is_empty() {
                    info!(count = names.len(), "restored offline sessions with pending queues");
                }
            }
            Err(e) => warn!(error = %e, "could not list durable queues at startup"),
        }

        let post_office = PostOffice::new(
            directory.clone(),
            registry.clone(),
            storage.retained.clone(),
            storage.subscriptions.clone(),
        );

        Ok(Self {
            config,
            storage,
            directory,
            registry,
            post_office,
        })
    }

    /// Open (or resume) the client's session and bind a fresh transport
    /// channel to it. A still-connected client is taken over: its previous
    /// handle's receiver closes.
    pub async fn connect(
        &self,
        client_id: &str,
        clean_session: bool,
    ) -> Result<ClientHandle, BrokerError> {
        let outcome = self.registry.open_session(client_id, clean_session).await?;
        if clean_session {
            // A clean start discards subscriptions from any earlier
            // incarnation of this client id
            if let Err(e) = self.post_office.remove_all_subscriptions(client_id).await {
                warn!(client_id, error = %e, "stale subscription cleanup failed on clean connect");
            }
        }
        let (tx, rx) = mpsc::channel(self.config.session.outbound_capacity);
        self.registry.bind(client_id, tx).await?;

        Ok(ClientHandle {
            client_id: Arc::from(client_id),
            session_present: !clean_session
                && matches!(outcome, OpenOutcome::Resumed | OpenOutcome::TakenOver),
            outbound: rx,
        })
    }

    /// Detach the client's transport. Clean sessions are evicted: queue
    /// purged and subscriptions dropped, durably and in memory.
    pub async fn disconnect(&self, client_id: &str) -> Result<(), BrokerError> {
        let clean = self.registry.unbind(client_id);
        if clean {
            if let Err(e) = self.post_office.remove_all_subscriptions(client_id).await {
                // Eviction proceeds; the directory no longer routes to us
                warn!(client_id, error = %e, "durable subscription cleanup failed on eviction");
            }
            self.registry.evict(client_id).await?;
        }
        Ok(())
    }

    /// Route a publish. Also the embedding application's injection point
    /// for server-originated messages.
    pub async fn internal_publish(&self, publish: Publish) -> RoutingResults {
        self.post_office.internal_publish(publish).await
    }

    pub async fn subscribe(
        &self,
        client_id: &str,
        filter: &str,
        qos: QoS,
    ) -> Result<QoS, SubscribeError> {
        self.post_office.subscribe(client_id, filter, qos).await
    }

    pub async fn unsubscribe(&self, client_id: &str, filter: &str) -> Result<(), SubscribeError> {
        self.post_office.unsubscribe(client_id, filter).await
    }

    /// Acknowledge a QoS 1/2 delivery.
    pub async fn acknowledge(&self, client_id: &str, message_id: u64) -> Result<bool, BrokerError> {
        Ok(self.post_office.acknowledge(client_id, message_id).await?)
    }

    pub fn connected_clients(&self) -> Vec<Arc<str>> {
        self.registry.connected_clients()
    }

    pub fn session_count(&self) -> usize {
        self.registry.session_count()
    }

    pub fn subscription_count(&self) -> usize {
        self.directory.subscription_count()
    }

    /// Stop background work and flush storage.
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        self.registry.shutdown();
        self.storage.close().await?;
        info!("broker core shut down");
        Ok(())
    }
}
