//! Session lifecycle and per-client delivery state.
//!
//! One `Session` per known client, connected or offline, each bound to its
//! own durable queue. The registry is the only writer of lifecycle
//! transitions: `Absent -> Connected -> Absent` for clean sessions,
//! `Connected -> Offline -> Connected` for persistent ones. A reconnect
//! while connected forces takeover: the previous transport is severed and
//! its retransmission sweep is rebound to the new transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::message::{EnqueuedMessage, QoS};
use crate::storage::{MessageQueue, QueueRepository, Result as StorageResult};
use crate::topic::Topic;

/// A message on its way to one client's transport.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Broker-assigned id; echoed back in the acknowledgment for QoS 1/2
    pub message_id: u64,
    pub topic: Topic,
    pub qos: QoS,
    pub payload: Bytes,
    pub retain: bool,
    /// Set on retransmissions
    pub dup: bool,
}

impl OutboundMessage {
    fn from_enqueued(message: &EnqueuedMessage, dup: bool) -> Self {
        Self {
            message_id: message.message_id,
            topic: message.topic.clone(),
            qos: message.qos,
            payload: message.payload.clone(),
            retain: message.retain,
            dup,
        }
    }
}

/// The transport write path for one live connection. The transport layer
/// passes the sender on bind and pumps the receiver out to the socket.
pub type Transport = mpsc::Sender<OutboundMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connected,
    Offline,
}

/// A QoS 1/2 message sent but not yet acknowledged.
struct InflightEntry {
    message: EnqueuedMessage,
    sent_at: Instant,
    retry_count: u32,
}

/// Server-side state for one client identity.
pub struct Session {
    pub client_id: Arc<str>,
    pub clean_session: bool,
    state: SessionState,
    transport: Option<Transport>,
    inflight: HashMap<u64, InflightEntry>,
    inflight_window: usize,
    queue: Arc<dyn MessageQueue>,
}

impl Session {
    fn new(client_id: Arc<str>, clean_session: bool, window: usize, queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            client_id,
            clean_session,
            state: SessionState::Offline,
            transport: None,
            inflight: HashMap::new(),
            inflight_window: window,
            queue,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn queue(&self) -> Arc<dyn MessageQueue> {
        self.queue.clone()
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    fn has_window_room(&self) -> bool {
        self.inflight.len() < self.inflight_window
    }

    /// Push to the bound transport; false when there is none or its channel
    /// is closed or full.
    fn send(&self, message: OutboundMessage) -> bool {
        match &self.transport {
            Some(transport) => transport.try_send(message).is_ok(),
            None => false,
        }
    }

    fn track_inflight(&mut self, message: EnqueuedMessage) {
        self.inflight.insert(
            message.message_id,
            InflightEntry {
                message,
                sent_at: Instant::now(),
                retry_count: 0,
            },
        );
    }

    fn acknowledge(&mut self, message_id: u64) -> bool {
        self.inflight.remove(&message_id).is_some()
    }

    /// Collect retransmissions due after `retry_interval`, bumping their
    /// retry metadata.
    fn expired_inflight(&mut self, retry_interval: Duration) -> Vec<OutboundMessage> {
        let now = Instant::now();
        self.inflight
            .values_mut()
            .filter(|entry| now.duration_since(entry.sent_at) >= retry_interval)
            .map(|entry| {
                entry.retry_count += 1;
                entry.sent_at = now;
                OutboundMessage::from_enqueued(&entry.message, true)
            })
            .collect()
    }
}

/// What `open_session` found for the client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// No prior state; a fresh session was created
    Created,
    /// A persistent offline session was resumed with its queue intact
    Resumed,
    /// The client was still connected; its previous transport was severed
    TakenOver,
}

/// Owns the authoritative clientId -> Session map.
pub struct SessionRegistry {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
    queues: Arc<dyn QueueRepository>,
    inflight_window: usize,
    retry_interval: Duration,
    /// Per-session retransmission sweeps, keyed like `sessions`
    sweeps: DashMap<Arc<str>, JoinHandle<()>>,
}

impl SessionRegistry {
    pub fn new(
        queues: Arc<dyn QueueRepository>,
        inflight_window: usize,
        retry_interval: Duration,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            queues,
            inflight_window,
            retry_interval,
            sweeps: DashMap::new(),
        }
    }

    /// Create or resume the session for a connecting client. Does not bind
    /// a transport; the caller follows up with [`bind`](Self::bind).
    pub async fn open_session(
        &self,
        client_id: &str,
        clean_session: bool,
    ) -> StorageResult<OpenOutcome> {
        let key: Arc<str> = Arc::from(client_id);

        let existing = self.sessions.get(&key).map(|entry| entry.value().clone());
        let Some(session) = existing else {
            if clean_session && self.queues.contains_queue(client_id).await? {
                // Stale durable queue from an earlier persistent incarnation
                let stale = self.queues.get_or_create_queue(client_id).await?;
                stale.close_and_purge().await?;
            }
            let queue = self.queues.get_or_create_queue(client_id).await?;
            let session = Session::new(key.clone(), clean_session, self.inflight_window, queue);
            self.sessions.insert(key, Arc::new(RwLock::new(session)));
            return Ok(OpenOutcome::Created);
        };

        let was_connected = {
            let mut s = session.write();
            let was = s.is_connected();
            s.transport = None;
            s.state = SessionState::Offline;
            s.clean_session = clean_session;
            was
        };
        if was_connected {
            self.abort_sweep(client_id);
            debug!(client_id, "session takeover: severed previous transport");
        }

        if clean_session {
            // Clean reconnect starts from nothing: drop queue and inflight
            let queue = session.read().queue();
            queue.close_and_purge().await?;
            let fresh = self.queues.get_or_create_queue(client_id).await?;
            let mut s = session.write();
            s.inflight.clear();
            s.queue = fresh;
        }

        Ok(if was_connected {
            OpenOutcome::TakenOver
        } else if clean_session {
            OpenOutcome::Created
        } else {
            OpenOutcome::Resumed
        })
    }

    /// Re-register a persistent session found in storage at startup.
    pub async fn restore_offline(&self, client_id: &str) -> StorageResult<()> {
        let key: Arc<str> = Arc::from(client_id);
        if self.sessions.contains_key(&key) {
            return Ok(());
        }
        let queue = self.queues.get_or_create_queue(client_id).await?;
        let session = Session::new(key.clone(), false, self.inflight_window, queue);
        self.sessions.insert(key, Arc::new(RwLock::new(session)));
        Ok(())
    }

    /// Attach a live transport and start delivering: queued messages are
    /// drained into the inflight window and a retransmission sweep is bound
    /// to the new transport.
    ///
    /// Panics if no session exists for `client_id`; the registry always
    /// creates the session on connect, so this is a caller bug.
    pub async fn bind(&self, client_id: &str, transport: Transport) -> StorageResult<()> {
        let session = self.expect_session(client_id);
        {
            let mut s = session.write();
            s.transport = Some(transport);
            s.state = SessionState::Connected;
        }
        self.spawn_sweep(client_id, session);
        self.drain(client_id).await?;
        Ok(())
    }

    /// Detach the transport on disconnect. Returns the session's clean flag
    /// so the caller can evict clean sessions.
    pub fn unbind(&self, client_id: &str) -> bool {
        let session = self.expect_session(client_id);
        let clean = {
            let mut s = session.write();
            s.transport = None;
            s.state = SessionState::Offline;
            s.clean_session
        };
        self.abort_sweep(client_id);
        clean
    }

    /// Drop a session and everything it queued. Discarding queued messages
    /// here is intentional clean-session semantics, not an error.
    pub async fn evict(&self, client_id: &str) -> StorageResult<()> {
        self.abort_sweep(client_id);
        if let Some((_, session)) = self.sessions.remove(client_id) {
            let queue = session.read().queue();
            queue.close_and_purge().await?;
        }
        Ok(())
    }

    pub fn session(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|entry| entry.value().clone())
    }

    fn expect_session(&self, client_id: &str) -> Arc<RwLock<Session>> {
        self.session(client_id)
            .unwrap_or_else(|| panic!("no session for client {:?}", client_id))
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    pub fn connected_clients(&self) -> Vec<Arc<str>> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().read().is_connected())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Append to the client's durable queue, then deliver immediately if the
    /// client is connected and its window has room. A session evicted while
    /// the fan-out is in flight loses the message, which is clean-session
    /// semantics, not an error.
    pub async fn enqueue(&self, client_id: &str, message: EnqueuedMessage) -> StorageResult<usize> {
        let Some(session) = self.session(client_id) else {
            return Ok(0);
        };
        let queue = session.read().queue();
        queue.enqueue(message).await?;
        self.drain(client_id).await
    }

    /// Push directly to the transport, bypassing the durable queue. QoS 0
    /// path; false when the session or transport is gone, or the channel is
    /// saturated.
    pub fn send_direct(&self, client_id: &str, message: OutboundMessage) -> bool {
        match self.session(client_id) {
            Some(session) => session.read().send(message),
            None => false,
        }
    }

    /// Move queued messages into the inflight window and out to the
    /// transport, preserving queue order. Returns how many were sent.
    pub async fn drain(&self, client_id: &str) -> StorageResult<usize> {
        let Some(session) = self.session(client_id) else {
            return Ok(0);
        };
        let mut sent = 0;
        loop {
            let queue = {
                let s = session.read();
                if !s.is_connected() || !s.has_window_room() {
                    break;
                }
                s.queue()
            };
            let Some(message) = queue.dequeue().await? else {
                break;
            };
            let outbound = OutboundMessage::from_enqueued(&message, false);
            {
                let mut s = session.write();
                if message.qos != QoS::AtMostOnce {
                    s.track_inflight(message);
                }
                if !s.send(outbound) {
                    trace!(client_id, "transport saturated during drain");
                }
            }
            sent += 1;
        }
        Ok(sent)
    }

    /// Complete a QoS 1/2 delivery and pull the next queued message into
    /// the freed window slot.
    pub async fn acknowledge(&self, client_id: &str, message_id: u64) -> StorageResult<bool> {
        let Some(session) = self.session(client_id) else {
            return Ok(false);
        };
        let acked = session.write().acknowledge(message_id);
        if acked {
            self.drain(client_id).await?;
        } else {
            warn!(client_id, message_id, "acknowledgment for unknown message");
        }
        Ok(acked)
    }

    fn spawn_sweep(&self, client_id: &str, session: Arc<RwLock<Session>>) {
        let retry_interval = self.retry_interval;
        let key: Arc<str> = Arc::from(client_id);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retry_interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let resends = {
                    let mut s = session.write();
                    if !s.is_connected() {
                        break;
                    }
                    s.expired_inflight(retry_interval)
                };
                if !resends.is_empty() {
                    let s = session.read();
                    for message in resends {
                        trace!(message_id = message.message_id, "retransmitting unacked message");
                        s.send(message);
                    }
                }
            }
        });
        if let Some(previous) = self.sweeps.insert(key, handle) {
            previous.abort();
        }
    }

    fn abort_sweep(&self, client_id: &str) {
        if let Some((_, handle)) = self.sweeps.remove(client_id) {
            handle.abort();
        }
    }

    /// Abort background work; storage shutdown is the owner's job.
    pub fn shutdown(&self) {
        for entry in self.sweeps.iter() {
            entry.value().abort();
        }
        self.sweeps.clear();
    }
}
