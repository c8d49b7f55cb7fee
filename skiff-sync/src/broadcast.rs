//! Fan-out of server events to subscribed connections.
//!
//! ```text
//!  producer ──add()──► encode once ──► Bytes (ref-counted)
//!                                         │
//!              ┌──────────────────────────┼──────────────────────────┐
//!              ▼                          ▼                          ▼
//!      conn A queue (Disk ✓)     conn B (Disk ✗) → NoChannel   conn C queue
//!              │                                                     │
//!        sender task A                                         sender task C
//! ```
//!
//! `add` only ever calls `try_send` on bounded per-connection queues, so a
//! producer never waits for network I/O. A full queue closes that one
//! connection; nothing propagates back to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use uuid::Uuid;

use crate::protocol::{encode, Channel, Command, ProtocolError, ServerEvent};
use crate::registry::ConnectionRegistry;

/// Result of handing one frame to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Queued for the connection's sender task
    Success,
    /// Queue full; the connection is being closed
    Failed,
    /// The connection did not subscribe to the channel
    NoChannel,
    /// The connection is already shutting down
    Canceled,
}

/// Per-connection outcomes of one `add` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastReport {
    pub outcomes: Vec<(Uuid, DeliveryOutcome)>,
}

impl BroadcastReport {
    pub fn outcome_for(&self, id: &Uuid) -> Option<DeliveryOutcome> {
        self.outcomes
            .iter()
            .find(|(conn_id, _)| conn_id == id)
            .map(|(_, outcome)| *outcome)
    }

    pub fn count(&self, outcome: DeliveryOutcome) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == outcome).count()
    }

    pub fn delivered(&self) -> usize {
        self.count(DeliveryOutcome::Success)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub deliveries_failed: u64,
    pub active_connections: usize,
}

/// Atomic broadcast stats, updated without taking a lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    deliveries_failed: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
        }
    }
}

/// Encodes events once and hands them to every interested connection.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    stats: AtomicBroadcastStats,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            stats: AtomicBroadcastStats::new(),
        }
    }

    /// Broadcast a raw command to every connection subscribed to its channel.
    pub fn add(&self, command: Command, parameter: u8, payload: Option<Value>) -> BroadcastReport {
        let frame = Bytes::from(encode(command.code(), parameter, payload.as_ref()));
        self.add_encoded(command.channel(), frame)
    }

    /// Broadcast a typed event.
    pub fn send(&self, event: &ServerEvent) -> Result<BroadcastReport, ProtocolError> {
        let frame = Bytes::from(event.encode()?);
        Ok(self.add_encoded(event.channel(), frame))
    }

    /// Broadcast pre-encoded bytes on `channel`.
    pub fn add_encoded(&self, channel: Channel, frame: Bytes) -> BroadcastReport {
        // The registry lock is released before any queue is touched.
        let connections = self.registry.snapshot();
        let mut report = BroadcastReport {
            outcomes: Vec::with_capacity(connections.len()),
        };

        for connection in connections {
            let outcome = if connection.subscribes(channel) {
                connection.enqueue(frame.clone())
            } else {
                DeliveryOutcome::NoChannel
            };
            match outcome {
                DeliveryOutcome::Failed => {
                    self.stats.deliveries_failed.fetch_add(1, Ordering::Relaxed);
                }
                DeliveryOutcome::Canceled => {
                    log::debug!(
                        "Skipped {:?} frame for closing connection {}",
                        channel,
                        connection.id()
                    );
                }
                DeliveryOutcome::Success | DeliveryOutcome::NoChannel => {}
            }
            report.outcomes.push((connection.id(), outcome));
        }

        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        report
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            deliveries_failed: self.stats.deliveries_failed.load(Ordering::Relaxed),
            active_connections: self.registry.len(),
        }
    }
}
