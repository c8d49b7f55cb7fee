//! Live set of authorized connections.
//!
//! A [`Connection`] is created once the handshake succeeds and is never
//! mutated afterwards except for its latency history. Its channel set is
//! fixed; re-subscribing requires a new handshake.
//!
//! The transport sink is owned by a single sender task per connection (see
//! `server`). Everything else reaches the socket through the connection's
//! bounded outbound queue, so frames leave in the order they were enqueued.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::DeliveryOutcome;
use crate::protocol::{Channel, ChannelSet, ClientInfo};

/// Round trips kept per connection.
pub const LATENCY_HISTORY: usize = 10;

/// Close code used when a consumer cannot keep up with its queue.
pub const SLOW_CONSUMER_CLOSE_CODE: u16 = 1013;

/// Items drained by a connection's sender task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// An encoded protocol frame
    Frame(Bytes),
    /// A transport-level ping carrying an opaque payload
    Ping(Bytes),
}

/// One authorized connection.
pub struct Connection {
    id: Uuid,
    friendly_name: String,
    remote_addr: SocketAddr,
    channels: ChannelSet,
    created_at: SystemTime,
    latency: Mutex<VecDeque<Duration>>,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    close_reason: Mutex<Option<(u16, String)>>,
}

impl Connection {
    pub fn new(
        friendly_name: impl Into<String>,
        remote_addr: SocketAddr,
        channels: ChannelSet,
        outbound: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            friendly_name: friendly_name.into(),
            remote_addr,
            channels,
            created_at: SystemTime::now(),
            latency: Mutex::new(VecDeque::with_capacity(LATENCY_HISTORY)),
            outbound,
            cancel,
            close_reason: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn channels(&self) -> ChannelSet {
        self.channels
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn subscribes(&self, channel: Channel) -> bool {
        self.channels.contains(channel)
    }

    /// Hand a frame to the sender task without waiting.
    ///
    /// A full queue means the consumer is too slow; the connection is closed
    /// and the delivery reported as failed.
    pub fn enqueue(&self, frame: Bytes) -> DeliveryOutcome {
        self.offer(Outbound::Frame(frame))
    }

    pub fn enqueue_ping(&self, payload: Bytes) -> DeliveryOutcome {
        self.offer(Outbound::Ping(payload))
    }

    fn offer(&self, item: Outbound) -> DeliveryOutcome {
        if self.cancel.is_cancelled() {
            return DeliveryOutcome::Canceled;
        }
        match self.outbound.try_send(item) {
            Ok(()) => DeliveryOutcome::Success,
            Err(TrySendError::Full(_)) => {
                log::warn!(
                    "Connection {} ({}) outbound queue full, closing",
                    self.id,
                    self.friendly_name
                );
                self.close(SLOW_CONSUMER_CLOSE_CODE, "outbound queue full");
                DeliveryOutcome::Failed
            }
            Err(TrySendError::Closed(_)) => DeliveryOutcome::Canceled,
        }
    }

    /// Request closure. Only the first call records its code; returns
    /// whether this call was the one that closed the connection.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some((code, reason.into()));
        }
        self.cancel.cancel();
        true
    }

    /// Code and reason recorded by the first [`Connection::close`] call.
    pub fn close_reason(&self) -> Option<(u16, String)> {
        self.close_reason.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when this connection must shut down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn record_latency(&self, rtt: Duration) {
        let mut history = self.latency.lock();
        if history.len() == LATENCY_HISTORY {
            history.pop_front();
        }
        history.push_back(rtt);
    }

    /// Most recent round trip.
    pub fn last_latency(&self) -> Option<Duration> {
        self.latency.lock().back().copied()
    }

    /// Mean round trip over the retained history, in milliseconds.
    pub fn average_latency_ms(&self) -> Option<u64> {
        let history = self.latency.lock();
        if history.is_empty() {
            return None;
        }
        let total: Duration = history.iter().sum();
        Some((total / history.len() as u32).as_millis() as u64)
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id,
            friendly_name: self.friendly_name.clone(),
            address: self.remote_addr.to_string(),
            connected_since_ms: self
                .created_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            latency_ms: self.average_latency_ms(),
        }
    }
}

/// All registered connections, keyed by id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection and run `prepare` while still holding the write
    /// lock.
    ///
    /// Broadcasters need the read lock, so nothing can reach the new
    /// connection before `prepare` returns. This is how the Setup frame is
    /// guaranteed to be first in its queue.
    pub fn register_with<R>(
        &self,
        connection: Arc<Connection>,
        prepare: impl FnOnce(&HashMap<Uuid, Arc<Connection>>) -> R,
    ) -> R {
        let mut connections = self.connections.write();
        connections.insert(connection.id(), connection);
        prepare(&connections)
    }

    pub fn register(&self, connection: Arc<Connection>) {
        self.register_with(connection, |_| ());
    }

    /// Remove a connection. Returns `None` if it was already removed.
    pub fn remove(&self, id: &Uuid) -> Option<Arc<Connection>> {
        self.connections.write().remove(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Connection>> {
        self.connections.read().get(id).cloned()
    }

    /// Clone of the current set; the lock is released on return.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        client_list(&self.connections.read())
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Close every registered connection with the same code.
    pub fn close_all(&self, code: u16, reason: &str) {
        for connection in self.snapshot() {
            connection.close(code, reason);
        }
    }
}

/// Clients list sorted by connection time.
pub fn client_list(connections: &HashMap<Uuid, Arc<Connection>>) -> Vec<ClientInfo> {
    let mut clients: Vec<ClientInfo> = connections.values().map(|c| c.info()).collect();
    clients.sort_by(|a, b| {
        a.connected_since_ms
            .cmp(&b.connected_since_ms)
            .then_with(|| a.id.cmp(&b.id))
    });
    clients
}
